//! Tri-color mark-and-sweep collector
//!
//! Roots are the globals and constants tables, any values the host or a
//! suspended interpretation parked in the context, and the acting VM's value
//! stack, call frames, and open-upvalue list. Marking greys the roots, the
//! blacken loop greys everything they own to a fixed point, and the sweeper
//! walks the live list freeing whatever stayed white — after the string
//! interner drops its entries for unreached strings.

use crate::context::Context;
use crate::heap::{Heap, Mark, ObjData, ObjRef};
use crate::value::Value;
use crate::vm::Vm;

/// Run a full collection with `vm` as the acting mutator
pub fn collect(ctx: &mut Context, vm: &Vm) {
    let mut grey: Vec<ObjRef> = Vec::new();

    {
        let heap = &mut ctx.heap;
        let mut mark_obj = |r: ObjRef| mark(heap, &mut grey, r);
        for v in ctx.globals.values() {
            if let Some(r) = v.as_obj() {
                mark_obj(r);
            }
        }
        for v in ctx.constants.values() {
            if let Some(r) = v.as_obj() {
                mark_obj(r);
            }
        }
        for &v in &ctx.protected {
            if let Some(r) = v.as_obj() {
                mark_obj(r);
            }
        }
    }

    {
        // Split borrows so the VM can feed roots straight into the marker.
        let heap = &mut ctx.heap;
        let grey_list = &mut grey;
        vm.for_each_root(&mut |v: Value| {
            if let Some(r) = v.as_obj() {
                mark(heap, grey_list, r);
            }
        });
    }

    // Blacken to a fixed point.
    while let Some(r) = grey.pop() {
        blacken(&mut ctx.heap, &mut grey, r);
    }

    // Interned strings nothing reached drop out of the intern table first,
    // then the sweeper frees them with everything else still white.
    ctx.strings.sweep(&ctx.heap);
    sweep(&mut ctx.heap);

    ctx.heap.finish_collection();
}

fn mark(heap: &mut Heap, grey: &mut Vec<ObjRef>, r: ObjRef) {
    if heap.header(r).mark == Mark::White {
        heap.header_mut(r).mark = Mark::Grey;
        grey.push(r);
    }
}

/// Grey everything `r` directly owns
fn blacken(heap: &mut Heap, grey: &mut Vec<ObjRef>, r: ObjRef) {
    let mut children: Vec<ObjRef> = Vec::new();
    match heap.get(r) {
        ObjData::Str { .. } | ObjData::Code(_) | ObjData::Boxed(_) => {}
        ObjData::Function(f) => {
            children.push(f.name);
            children.push(f.short_name);
            if let Some(code) = f.code {
                children.push(code);
            }
        }
        ObjData::Closure { function, upvalues } => {
            children.push(*function);
            children.extend(upvalues.iter().copied());
        }
        ObjData::Map(map) => {
            map.for_each(|k, v| {
                if let Some(r) = k.as_obj() {
                    children.push(r);
                }
                if let Some(r) = v.as_obj() {
                    children.push(r);
                }
            });
        }
        ObjData::Instance {
            map,
            class,
            super_obj,
        } => {
            children.push(*class);
            if let Some(s) = super_obj {
                children.push(*s);
            }
            map.for_each(|k, v| {
                if let Some(r) = k.as_obj() {
                    children.push(r);
                }
                if let Some(r) = v.as_obj() {
                    children.push(r);
                }
            });
        }
        ObjData::Upvalue(u) => {
            if let crate::heap::Upvalue::Closed { value } = u {
                if let Some(r) = value.as_obj() {
                    children.push(r);
                }
            }
        }
        ObjData::Syscall { name, .. } => {
            children.push(*name);
        }
    }

    for child in children {
        mark(heap, grey, child);
    }
}

/// Walk the live list: repaint survivors white, free the rest
fn sweep(heap: &mut Heap) {
    let mut cursor = heap.live_head();
    while let Some(r) = cursor {
        let next = heap.live_next(r);
        if heap.header(r).mark == Mark::Grey {
            heap.header_mut(r).mark = Mark::White;
        } else {
            heap.free(r);
        }
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ValueMap;

    #[test]
    fn test_unreferenced_objects_are_swept() {
        let mut ctx = Context::new();
        let vm = Vm::new();
        let keep = ctx.heap.alloc(ObjData::Map(ValueMap::new()));
        let _lose = ctx.heap.alloc(ObjData::Map(ValueMap::new()));
        let idx = ctx.globals.add("::keep");
        ctx.globals.set(idx, Value::obj(keep));

        collect(&mut ctx, &vm);
        assert_eq!(ctx.heap.live_count(), 1);
        assert!(!ctx.heap.collect_pending);
    }

    #[test]
    fn test_map_entries_stay_reachable() {
        let mut ctx = Context::new();
        let vm = Vm::new();
        let inner = ctx.heap.alloc(ObjData::Map(ValueMap::new()));
        let outer = ctx.heap.alloc(ObjData::Map(ValueMap::new()));
        let key = ctx.intern_value("inner");
        {
            let mut map = match ctx.heap.get_mut(outer) {
                ObjData::Map(m) => std::mem::take(m),
                _ => unreachable!(),
            };
            map.add(&ctx.heap, key, Value::obj(inner));
            if let ObjData::Map(m) = ctx.heap.get_mut(outer) {
                *m = map;
            }
        }
        let idx = ctx.globals.add("::outer");
        ctx.globals.set(idx, Value::obj(outer));

        collect(&mut ctx, &vm);
        // outer, inner and the interned key all survive
        assert_eq!(ctx.heap.live_count(), 3);
        assert_eq!(ctx.strings.len(), 1);
    }

    #[test]
    fn test_unreached_interned_strings_drop_from_table() {
        let mut ctx = Context::new();
        let vm = Vm::new();
        ctx.intern("orphan");
        let kept = ctx.intern_value("kept");
        let idx = ctx.globals.add("::kept");
        ctx.globals.set(idx, kept);

        collect(&mut ctx, &vm);
        assert_eq!(ctx.strings.len(), 1);
        assert!(ctx.strings.lookup(&ctx.heap, "orphan").is_none());
        // Re-interning after the sweep builds a fresh object.
        let again = ctx.intern("orphan");
        assert_ne!(Value::obj(again), Value::NIL);
    }

    #[test]
    fn test_protected_values_survive() {
        let mut ctx = Context::new();
        let vm = Vm::new();
        let parked = ctx.heap.alloc(ObjData::Map(ValueMap::new()));
        ctx.protected.push(Value::obj(parked));

        collect(&mut ctx, &vm);
        assert_eq!(ctx.heap.live_count(), 1);
    }

    #[test]
    fn test_threshold_doubles_after_collection() {
        let mut ctx = Context::new();
        let vm = Vm::new();
        ctx.heap.alloc(ObjData::Map(ValueMap::new()));
        assert!(ctx.heap.collect_pending);
        collect(&mut ctx, &vm);
        // Everything died; the threshold resets from the now-empty heap.
        assert_eq!(ctx.heap.heap_size(), 0);
        assert!(!ctx.heap.collect_pending);
    }
}
