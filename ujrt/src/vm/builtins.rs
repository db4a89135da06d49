//! Builtin ("fast") functions.

use smallvec::{smallvec, SmallVec};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::vm::{
    heap::Heap,
    obj::{Closure, Str, Table},
    value::{GcPtr, Tag, TValue},
    VmError,
};

/// The results of a builtin.
pub type FfResults = SmallVec<[TValue; 3]>;

/// The identity of a builtin function. [FfId::Lua] marks closures of Lua prototypes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumIter, PartialEq, Eq, Hash)]
pub enum FfId {
    Lua,
    #[strum(serialize = "assert")]
    Assert,
    #[strum(serialize = "type")]
    Type,
    #[strum(serialize = "next")]
    Next,
    #[strum(serialize = "pairs")]
    Pairs,
    #[strum(serialize = "ipairs")]
    Ipairs,
    #[strum(serialize = "ipairs_aux")]
    IpairsAux,
    #[strum(serialize = "rawget")]
    Rawget,
    #[strum(serialize = "setmetatable")]
    Setmetatable,
    #[strum(serialize = "tostring")]
    Tostring,
    #[strum(serialize = "math.floor")]
    MathFloor,
    #[strum(serialize = "math.ceil")]
    MathCeil,
    #[strum(serialize = "math.abs")]
    MathAbs,
    #[strum(serialize = "math.sqrt")]
    MathSqrt,
    #[strum(serialize = "math.min")]
    MathMin,
    #[strum(serialize = "math.max")]
    MathMax,
    #[strum(serialize = "string.len")]
    StrLen,
    #[strum(serialize = "string.byte")]
    StrByte,
    #[strum(serialize = "string.sub")]
    StrSub,
    #[strum(serialize = "table.insert")]
    TableInsert,
}

/// Builtin closures returned by other builtins.
pub(crate) struct FfClosures {
    pub(crate) next: GcPtr<Closure>,
    pub(crate) ipairs_aux: GcPtr<Closure>,
}

/// Create every builtin and register it in `globals`, putting dotted names into library tables.
pub(crate) fn open_libs(heap: &mut Heap, globals: GcPtr<Table>) -> FfClosures {
    let ipairs_aux = heap.new_fast(FfId::IpairsAux);
    let mut next = None;
    for ffid in FfId::iter().filter(|x| !matches!(x, FfId::Lua | FfId::IpairsAux)) {
        let name = ffid.to_string();
        let fc = heap.new_fast(ffid);
        if ffid == FfId::Next {
            next = Some(fc);
        }
        let f = TValue::func(fc);
        let (tab, key) = match name.split_once('.') {
            Some((lib, key)) => {
                let libk = TValue::str(heap.intern(lib));
                let lt = match globals.get(&libk).as_tab() {
                    Some(t) => t,
                    None => {
                        let t = heap.new_table(0, 0);
                        globals.as_mut().set(&libk, TValue::tab(t)).ok();
                        t
                    }
                };
                (lt, key.to_owned())
            }
            None => (globals, name),
        };
        let k = TValue::str(heap.intern(&key));
        tab.as_mut().set(&k, f).ok();
    }
    FfClosures {
        next: next.unwrap_or_else(|| heap.new_fast(FfId::Next)),
        ipairs_aux,
    }
}

fn arg(args: &[TValue], i: usize) -> TValue {
    args.get(i).copied().unwrap_or(TValue::NIL)
}

fn bad_arg(ffid: FfId, i: usize, msg: &str) -> VmError {
    VmError::BadArgument {
        arg: i + 1,
        name: ffid.to_string(),
        msg: msg.to_owned(),
    }
}

fn num_arg(ffid: FfId, args: &[TValue], i: usize) -> Result<f64, VmError> {
    arg(args, i)
        .as_num()
        .ok_or_else(|| bad_arg(ffid, i, "number expected"))
}

fn tab_arg(ffid: FfId, args: &[TValue], i: usize) -> Result<GcPtr<Table>, VmError> {
    arg(args, i)
        .as_tab()
        .ok_or_else(|| bad_arg(ffid, i, "table expected"))
}

/// Format a number the way scripts expect to see it.
pub fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

/// Resolve a Lua-style (1-based, negative-from-end) string position.
pub(crate) fn str_pos(i: f64, len: usize) -> i64 {
    let i = i as i64;
    if i < 0 {
        (len as i64 + i + 1).max(0)
    } else {
        i
    }
}

/// Call the builtin `ffid` with `args`.
pub(crate) fn call(
    heap: &mut Heap,
    ffid: FfId,
    ffc: &FfClosures,
    args: &[TValue],
) -> Result<FfResults, VmError> {
    Ok(match ffid {
        FfId::Lua => unreachable!(),
        FfId::Assert => {
            if !arg(args, 0).is_truthy() {
                return Err(VmError::Assert);
            }
            args.iter().copied().collect()
        }
        FfId::Type => {
            let a = args.first().ok_or_else(|| bad_arg(ffid, 0, "value expected"))?;
            smallvec![TValue::str(heap.intern(a.tag().type_name()))]
        }
        FfId::Next => {
            let t = tab_arg(ffid, args, 0)?;
            match t.next(&arg(args, 1))? {
                Some((k, v)) => smallvec![k, v],
                None => smallvec![TValue::NIL],
            }
        }
        FfId::Pairs => {
            let t = tab_arg(ffid, args, 0)?;
            smallvec![TValue::func(ffc.next), TValue::tab(t), TValue::NIL]
        }
        FfId::Ipairs => {
            let t = tab_arg(ffid, args, 0)?;
            smallvec![TValue::func(ffc.ipairs_aux), TValue::tab(t), TValue::num(0.0)]
        }
        FfId::IpairsAux => {
            let t = tab_arg(ffid, args, 0)?;
            let i = num_arg(ffid, args, 1)? + 1.0;
            let v = t.get(&TValue::num(i));
            if v.is_nil() {
                smallvec![]
            } else {
                smallvec![TValue::num(i), v]
            }
        }
        FfId::Rawget => {
            let t = tab_arg(ffid, args, 0)?;
            smallvec![t.get(&arg(args, 1))]
        }
        FfId::Setmetatable => {
            let t = tab_arg(ffid, args, 0)?;
            let mt = arg(args, 1);
            match mt.tag() {
                Tag::Nil => t.as_mut().set_meta(None),
                Tag::Tab => t.as_mut().set_meta(mt.as_tab()),
                _ => return Err(bad_arg(ffid, 1, "nil or table expected")),
            }
            smallvec![TValue::tab(t)]
        }
        FfId::Tostring => {
            let a = arg(args, 0);
            let s = match a.tag() {
                Tag::Num => fmt_num(f64::from_bits(a.u)),
                Tag::Str => return Ok(smallvec![a]),
                Tag::Nil => "nil".to_owned(),
                Tag::True => "true".to_owned(),
                Tag::False => "false".to_owned(),
                t => format!("{}: {:#x}", t.type_name(), a.u),
            };
            smallvec![TValue::str(heap.intern(&s))]
        }
        FfId::MathFloor => smallvec![TValue::num(num_arg(ffid, args, 0)?.floor())],
        FfId::MathCeil => smallvec![TValue::num(num_arg(ffid, args, 0)?.ceil())],
        FfId::MathAbs => smallvec![TValue::num(num_arg(ffid, args, 0)?.abs())],
        FfId::MathSqrt => smallvec![TValue::num(num_arg(ffid, args, 0)?.sqrt())],
        FfId::MathMin | FfId::MathMax => {
            let mut r = num_arg(ffid, args, 0)?;
            for i in 1..args.len() {
                let x = num_arg(ffid, args, i)?;
                // Mirror the comparisons generated code uses so that NaNs behave identically.
                r = if ffid == FfId::MathMin {
                    if x < r {
                        x
                    } else {
                        r
                    }
                } else if x > r {
                    x
                } else {
                    r
                };
            }
            smallvec![TValue::num(r)]
        }
        FfId::StrLen => {
            let s = arg(args, 0)
                .as_str()
                .ok_or_else(|| bad_arg(ffid, 0, "string expected"))?;
            smallvec![TValue::num(s.len() as f64)]
        }
        FfId::StrByte => {
            let s = arg(args, 0)
                .as_str()
                .ok_or_else(|| bad_arg(ffid, 0, "string expected"))?;
            let i = if args.len() > 1 {
                num_arg(ffid, args, 1)?
            } else {
                1.0
            };
            let i = str_pos(i, s.len());
            if i >= 1 && (i as usize) <= s.len() {
                smallvec![TValue::num(f64::from(s.as_str().as_bytes()[i as usize - 1]))]
            } else {
                smallvec![]
            }
        }
        FfId::StrSub => {
            let s = arg(args, 0)
                .as_str()
                .ok_or_else(|| bad_arg(ffid, 0, "string expected"))?;
            let i = num_arg(ffid, args, 1)?;
            let j = if args.len() > 2 {
                num_arg(ffid, args, 2)?
            } else {
                -1.0
            };
            smallvec![TValue::str(str_sub(heap, s, i, j))]
        }
        FfId::TableInsert => {
            let t = tab_arg(ffid, args, 0)?;
            let n = t.len();
            match args.len() {
                2 => t.as_mut().set_int(n + 1, args[1]),
                3 => {
                    let pos = num_arg(ffid, args, 1)?;
                    let pos = crate::vm::obj::num_as_index(pos)
                        .filter(|p| *p >= 1 && *p <= n + 1)
                        .ok_or_else(|| bad_arg(ffid, 1, "position out of bounds"))?;
                    let mut i = n;
                    while i >= pos {
                        let v = t.get_int(i);
                        t.as_mut().set_int(i + 1, v);
                        i -= 1;
                    }
                    t.as_mut().set_int(pos, args[2]);
                }
                _ => return Err(bad_arg(ffid, 1, "wrong number of arguments")),
            }
            smallvec![]
        }
    })
}

/// `string.sub` semantics.
pub(crate) fn str_sub(
    heap: &mut Heap,
    s: GcPtr<Str>,
    i: f64,
    j: f64,
) -> GcPtr<Str> {
    let len = s.len();
    let i = str_pos(i, len).max(1);
    let j = str_pos(j, len).min(len as i64);
    if i > j {
        heap.intern("")
    } else {
        let b = &s.as_str().as_bytes()[(i - 1) as usize..j as usize];
        heap.intern(&String::from_utf8_lossy(b))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_positions() {
        let mut h = Heap::new();
        let s = h.intern("hello");
        assert_eq!(str_sub(&mut h, s, 2.0, 3.0).as_str(), "el");
        assert_eq!(str_sub(&mut h, s, -3.0, -1.0).as_str(), "llo");
        assert_eq!(str_sub(&mut h, s, 4.0, 2.0).as_str(), "");
        assert_eq!(fmt_num(3.0), "3");
        assert_eq!(fmt_num(0.5), "0.5");
    }

    #[test]
    fn libs_registered() {
        let mut h = Heap::new();
        let g = h.new_table(0, 0);
        open_libs(&mut h, g);
        let math = g.get(&TValue::str(h.intern("math"))).as_tab().unwrap();
        let floor = math.get(&TValue::str(h.intern("floor"))).as_func().unwrap();
        assert_eq!(floor.ffid, FfId::MathFloor);
        assert!(g.get(&TValue::str(h.intern("ipairs_aux"))).is_nil());
    }
}
