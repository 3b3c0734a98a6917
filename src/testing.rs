// Builds fake target heaps for tests: every allocation is its own snapshot segment with unmapped gaps in between,
// so reading past the end of anything fails the way it would on a real unmapped page.

use crate::{*, error::*, procfs::*, layout::*};
use std::sync::Arc;

pub struct HeapBuilder {
    segments: Vec<(usize, Vec<u8>)>,
    next: usize,
    string_type: Option<usize>,
}

#[derive(Clone)]
pub struct TypeSpec {
    pub instance_size: i32,
    pub super_type: usize,
    pub obj_offsets: Vec<i32>,
    pub flags: u32,
    pub class_id: i32,
    pub extended: usize,
    pub package_name: usize,
    pub relative_name: usize,
    pub associated_objects: usize,
    pub interface_table: Vec<(i32, u32, usize)>,
    pub implemented_interfaces: Vec<usize>,
}
impl Default for TypeSpec {
    fn default() -> Self { Self {instance_size: 8, super_type: 0, obj_offsets: Vec::new(), flags: 0, class_id: 1, extended: 0, package_name: 0, relative_name: 0, associated_objects: 0, interface_table: Vec::new(), implemented_interfaces: Vec::new()} }
}

impl HeapBuilder {
    pub fn new() -> Self { Self {segments: Vec::new(), next: 0x10000, string_type: None} }

    pub fn alloc(&mut self, len: usize) -> usize {
        let addr = self.next;
        self.segments.push((addr, vec![0u8; len]));
        self.next = util::align_up(addr + len.max(1), 16) + 0x100;
        addr
    }

    fn slot(&mut self, addr: usize, len: usize) -> &mut [u8] {
        for (start, data) in &mut self.segments {
            if *start <= addr && addr + len <= *start + data.len() {
                let off = addr - *start;
                return &mut data[off..off + len];
            }
        }
        panic!("write outside of allocations: 0x{:x}+{}", addr, len);
    }

    pub fn put_bytes(&mut self, addr: usize, b: &[u8]) { self.slot(addr, b.len()).copy_from_slice(b); }
    pub fn put_usize(&mut self, addr: usize, x: usize) { self.put_bytes(addr, &x.to_le_bytes()); }
    pub fn put_i32(&mut self, addr: usize, x: i32) { self.put_bytes(addr, &x.to_le_bytes()); }
    pub fn put_u32(&mut self, addr: usize, x: u32) { self.put_bytes(addr, &x.to_le_bytes()); }

    // Shrinks an allocation, so that everything after `len` becomes unmapped.
    pub fn truncate(&mut self, addr: usize, len: usize) {
        for (start, data) in &mut self.segments {
            if *start == addr {
                data.truncate(len);
                return;
            }
        }
        panic!("no allocation at 0x{:x}", addr);
    }

    pub fn cstring(&mut self, s: &str) -> usize {
        let a = self.alloc(s.len() + 1);
        self.put_bytes(a, s.as_bytes());
        a
    }

    pub fn i32_array(&mut self, v: &[i32]) -> usize {
        let a = self.alloc(v.len() * 4);
        for (i, x) in v.iter().enumerate() {
            self.put_i32(a + i * 4, *x);
        }
        a
    }

    pub fn ptr_array(&mut self, v: &[usize]) -> usize {
        let a = self.alloc(v.len() * 8);
        for (i, x) in v.iter().enumerate() {
            self.put_usize(a + i * 8, *x);
        }
        a
    }

    pub fn type_info(&mut self, spec: &TypeSpec) -> usize {
        let a = self.alloc(type_info::SIZE);
        self.write_type_info(a, spec);
        a
    }

    pub fn write_type_info(&mut self, a: usize, spec: &TypeSpec) {
        use crate::layout::type_info::*;
        self.put_usize(a + SELF, a);
        self.put_usize(a + EXTENDED_INFO, spec.extended);
        self.put_i32(a + INSTANCE_SIZE, spec.instance_size);
        self.put_usize(a + SUPER_TYPE, spec.super_type);
        if !spec.obj_offsets.is_empty() {
            let offs = self.i32_array(&spec.obj_offsets);
            self.put_usize(a + OBJ_OFFSETS, offs);
        }
        self.put_i32(a + OBJ_OFFSETS_COUNT, spec.obj_offsets.len() as i32);
        if !spec.implemented_interfaces.is_empty() {
            let p = self.ptr_array(&spec.implemented_interfaces);
            self.put_usize(a + IMPLEMENTED_INTERFACES, p);
        }
        self.put_i32(a + IMPLEMENTED_INTERFACES_COUNT, spec.implemented_interfaces.len() as i32);
        if !spec.interface_table.is_empty() {
            let t = self.alloc(spec.interface_table.len() * interface_table_record::SIZE);
            for (i, &(id, size, vtable)) in spec.interface_table.iter().enumerate() {
                let r = t + i * interface_table_record::SIZE;
                self.put_i32(r + interface_table_record::ID, id);
                self.put_u32(r + interface_table_record::VTABLE_SIZE, size);
                self.put_usize(r + interface_table_record::VTABLE, vtable);
            }
            self.put_usize(a + INTERFACE_TABLE, t);
        }
        self.put_i32(a + INTERFACE_TABLE_SIZE, spec.interface_table.len() as i32);
        self.put_usize(a + PACKAGE_NAME, spec.package_name);
        self.put_usize(a + RELATIVE_NAME, spec.relative_name);
        self.put_u32(a + FLAGS, spec.flags);
        self.put_i32(a + CLASS_ID, spec.class_id);
        self.put_usize(a + ASSOCIATED_OBJECTS, spec.associated_objects);
        self.put_u32(a + INSTANCE_ALIGNMENT, 8);
    }

    pub fn extended(&mut self, fields: &[(i32, u8, &str)], debug_operations: &[usize]) -> usize {
        use crate::layout::extended_type_info::*;
        let a = self.alloc(SIZE);
        self.put_i32(a + FIELDS_COUNT, fields.len() as i32);
        if !fields.is_empty() {
            let offsets: Vec<i32> = fields.iter().map(|f| f.0).collect();
            let offsets = self.i32_array(&offsets);
            let kinds: Vec<u8> = fields.iter().map(|f| f.1).collect();
            let kinds_addr = self.alloc(kinds.len());
            self.put_bytes(kinds_addr, &kinds);
            let names: Vec<usize> = fields.iter().map(|f| self.cstring(f.2)).collect();
            let names = self.ptr_array(&names);
            self.put_usize(a + FIELD_OFFSETS, offsets);
            self.put_usize(a + FIELD_TYPES, kinds_addr);
            self.put_usize(a + FIELD_NAMES, names);
        }
        self.put_i32(a + DEBUG_OPERATIONS_COUNT, debug_operations.len() as i32);
        if !debug_operations.is_empty() {
            let ops = self.ptr_array(debug_operations);
            self.put_usize(a + DEBUG_OPERATIONS, ops);
        }
        a
    }

    // Extended descriptor of an array type: negated element kind, no fields.
    pub fn extended_array(&mut self, element: RuntimeKind) -> usize {
        let a = self.alloc(extended_type_info::SIZE);
        self.put_i32(a + extended_type_info::FIELDS_COUNT, -(element as i32));
        a
    }

    pub fn object(&mut self, type_info: usize, size: usize) -> usize {
        let a = self.alloc(size.max(obj_header::SIZE));
        self.put_usize(a, type_info);
        a
    }

    pub fn array(&mut self, type_info: usize, count: u32, payload: &[u8]) -> usize {
        let a = self.alloc(array_header::SIZE + payload.len());
        self.put_usize(a, type_info);
        self.put_u32(a + array_header::COUNT, count);
        self.put_bytes(a + array_header::SIZE, payload);
        a
    }

    pub fn meta(&mut self, type_info: usize, flags: MetaFlags) -> usize {
        let a = self.alloc(meta_header::SIZE);
        self.put_usize(a + meta_header::TYPE_INFO, type_info);
        self.put_u32(a + meta_header::FLAGS, flags.bits());
        a
    }

    pub fn string_type(&mut self) -> usize {
        if let Some(t) = self.string_type {
            return t;
        }
        let ext = self.extended_array(RuntimeKind::Int16);
        let t = self.type_info(&TypeSpec {instance_size: -2, extended: ext, class_id: 2, ..Default::default()});
        self.string_type = Some(t);
        let pkg = self.string("kotlin");
        let rel = self.string("String");
        self.put_usize(t + type_info::PACKAGE_NAME, pkg);
        self.put_usize(t + type_info::RELATIVE_NAME, rel);
        t
    }

    pub fn string(&mut self, s: &str) -> usize {
        let t = self.string_type();
        let units: Vec<u16> = s.encode_utf16().collect();
        let payload: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
        self.array(t, units.len() as u32, &payload)
    }

    // A named class: package and relative name strings filled in.
    pub fn named_type(&mut self, package: &str, name: &str, mut spec: TypeSpec) -> usize {
        spec.package_name = if package.is_empty() { 0 } else { self.string(package) };
        spec.relative_name = self.string(name);
        self.type_info(&spec)
    }

    pub fn finish(self) -> MemReader {
        let mut s = MemSnapshot::new();
        for (start, data) in self.segments {
            if let Err(e) = s.add_segment(start, data) {
                panic!("{}", e);
            }
        }
        MemReader::Snapshot(Arc::new(s))
    }
}
