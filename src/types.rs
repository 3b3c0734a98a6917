use crate::{*, error::*, layout::*, procfs::*, settings::*, object::*};
use std::{fmt, collections::HashSet};

// Views over the runtime's TypeInfo records, read from the target's memory.
// A TypeDescriptor is a snapshot of the fixed-size scalar part, taken with two reads (self-reference, then the rest).
// Everything reachable through pointers (offsets table, extended info, interface table, associated objects, names)
// is read lazily and afresh each time it's asked for; the target may have changed in between, and that's fine.

// Sign of TypeInfo.instanceSize_ picks one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceSize {
    // Scalar object, size in bytes including the header.
    Fixed(usize),
    // Array or string; element size in bytes.
    ArrayElement(usize),
}
impl InstanceSize {
    pub fn from_raw(raw: i32) -> Self {
        if raw >= 0 {
            InstanceSize::Fixed(raw as usize)
        } else {
            InstanceSize::ArrayElement((raw as i64).unsigned_abs() as usize)
        }
    }
}

#[derive(Clone, Debug)]
pub struct TypeDescriptor {
    pub addr: usize,
    pub extended_info: usize, // 0 if absent
    pub instance_size_raw: i32,
    pub instance_size: InstanceSize,
    pub super_type: usize,
    pub obj_offsets: usize,
    pub obj_offsets_count: usize,
    pub implemented_interfaces: usize,
    pub implemented_interfaces_count: usize,
    // Negative means there's no table for fast lookup.
    pub interface_table_size: i32,
    pub interface_table: usize,
    pub package_name: usize, // kotlin.String object, may be 0
    pub relative_name: usize,
    pub raw_flags: u32,
    pub class_id: i32,
    pub associated_objects: usize, // 0 if none
    pub instance_alignment: u32,
}

fn field_i32(block: &[u8], off: usize) -> i32 { i32::from_le_bytes([block[off], block[off+1], block[off+2], block[off+3]]) }
fn field_u32(block: &[u8], off: usize) -> u32 { field_i32(block, off) as u32 }
fn field_usize(block: &[u8], off: usize) -> usize {
    let mut a = [0u8; 8];
    a.copy_from_slice(&block[off..off+8]);
    usize::from_le_bytes(a)
}

pub fn read_type_descriptor(memory: &MemReader, addr: usize) -> Result<TypeDescriptor> {
    use crate::layout::type_info::*;
    if addr == 0 {
        return err_at!(CorruptDescriptor, addr, "null type info");
    }
    if addr % ALIGNMENT != 0 {
        return err_at!(CorruptDescriptor, addr, "misaligned type info");
    }
    // Check the self-reference before touching anything else, so that a bad pointer doesn't make us read further.
    let self_ref = memory.read_usize(addr + SELF).map_err(|e| e.at(addr))?;
    if self_ref != addr {
        return err_at!(CorruptDescriptor, addr, "type info self-reference mismatch: 0x{:x}", self_ref);
    }

    let mut block = [0u8; SIZE];
    memory.read(addr, &mut block).map_err(|e| e.at(addr))?;
    let b = &block[..];

    let instance_size_raw = field_i32(b, INSTANCE_SIZE);
    let obj_offsets = field_usize(b, OBJ_OFFSETS);
    let obj_offsets_count = field_i32(b, OBJ_OFFSETS_COUNT);
    let implemented_interfaces = field_usize(b, IMPLEMENTED_INTERFACES);
    let implemented_interfaces_count = field_i32(b, IMPLEMENTED_INTERFACES_COUNT);
    let interface_table_size = field_i32(b, INTERFACE_TABLE_SIZE);
    let interface_table = field_usize(b, INTERFACE_TABLE);

    if obj_offsets_count < 0 {
        return err_at!(CorruptDescriptor, addr, "negative objOffsetsCount: {}", obj_offsets_count);
    }
    if obj_offsets_count > 0 && obj_offsets == 0 {
        return err_at!(CorruptDescriptor, addr, "objOffsetsCount is {} but objOffsets is null", obj_offsets_count);
    }
    if implemented_interfaces_count < 0 || (implemented_interfaces_count > 0 && implemented_interfaces == 0) {
        return err_at!(CorruptDescriptor, addr, "bad implemented interfaces: {} @0x{:x}", implemented_interfaces_count, implemented_interfaces);
    }
    if interface_table_size > 0 && interface_table == 0 {
        return err_at!(CorruptDescriptor, addr, "interfaceTableSize is {} but interfaceTable is null", interface_table_size);
    }

    Ok(TypeDescriptor {
        addr,
        extended_info: field_usize(b, EXTENDED_INFO),
        instance_size_raw,
        instance_size: InstanceSize::from_raw(instance_size_raw),
        super_type: field_usize(b, SUPER_TYPE),
        obj_offsets,
        obj_offsets_count: obj_offsets_count as usize,
        implemented_interfaces,
        implemented_interfaces_count: implemented_interfaces_count as usize,
        interface_table_size,
        interface_table,
        package_name: field_usize(b, PACKAGE_NAME),
        relative_name: field_usize(b, RELATIVE_NAME),
        raw_flags: field_u32(b, FLAGS),
        class_id: field_i32(b, CLASS_ID),
        associated_objects: field_usize(b, ASSOCIATED_OBJECTS),
        instance_alignment: field_u32(b, INSTANCE_ALIGNMENT),
    })
}

impl TypeDescriptor {
    pub fn is_array_kind(&self) -> bool { match self.instance_size { InstanceSize::ArrayElement(_) => true, InstanceSize::Fixed(_) => false } }

    pub fn element_size(&self) -> Result<usize> {
        match self.instance_size {
            InstanceSize::ArrayElement(s) => Ok(s),
            InstanceSize::Fixed(_) => err_at!(TypeMismatch, self.addr, "not an array type"),
        }
    }

    pub fn fixed_size(&self) -> Result<usize> {
        match self.instance_size {
            InstanceSize::Fixed(s) => Ok(s),
            InstanceSize::ArrayElement(_) => err_at!(TypeMismatch, self.addr, "array type has no fixed size"),
        }
    }

    // Unknown bits are dropped; raw_flags has them.
    pub fn flags(&self) -> TypeFlags { TypeFlags::from_bits_truncate(self.raw_flags) }
    pub fn class_id(&self) -> i32 { self.class_id }
    // None only for kotlin.Any.
    pub fn super_type(&self) -> Option<usize> { if self.super_type == 0 { None } else { Some(self.super_type) } }
    pub fn has_extended(&self) -> bool { self.extended_info != 0 }

    pub fn extended(&self, memory: &MemReader, settings: &Settings) -> Result<Option<ExtendedTypeDescriptor>> {
        if self.extended_info == 0 {
            return Ok(None);
        }
        read_extended_type_descriptor(memory, self.extended_info, settings).map(Some)
    }

    // Byte offsets (from object start) of all reference fields.
    pub fn obj_offsets(&self, memory: &MemReader, settings: &Settings) -> Result<Vec<usize>> {
        if self.obj_offsets_count == 0 {
            return Ok(Vec::new());
        }
        if self.obj_offsets_count > settings.max_fields {
            return err_at!(ImplausibleLength, self.addr, "objOffsetsCount too big: {}", self.obj_offsets_count);
        }
        let raw = memory.read_vec(self.obj_offsets, self.obj_offsets_count * 4)?;
        let mut res = Vec::with_capacity(self.obj_offsets_count);
        for c in raw.chunks_exact(4) {
            let o = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            if o < 0 {
                return err_at!(CorruptDescriptor, self.addr, "negative reference field offset: {}", o);
            }
            res.push(o as usize);
        }
        Ok(res)
    }

    pub fn implemented_interfaces(&self, memory: &MemReader, settings: &Settings) -> Result<Vec<usize>> {
        let n = self.implemented_interfaces_count;
        if n == 0 {
            return Ok(Vec::new());
        }
        if n > settings.max_table_entries {
            return err_at!(ImplausibleLength, self.addr, "too many implemented interfaces: {}", n);
        }
        let raw = memory.read_vec(self.implemented_interfaces, n * POINTER_SIZE)?;
        Ok(raw.chunks_exact(8).map(|c| field_usize(c, 0)).collect())
    }

    pub fn interface_table<'a>(&self, memory: &'a MemReader, settings: &Settings) -> InterfaceTable<'a> {
        let declared = self.interface_table_size.max(0) as usize;
        let len = declared.min(settings.max_table_entries);
        InterfaceTable {memory, addr: self.interface_table, len, declared, idx: 0, failed: false}
    }

    pub fn associated_objects<'a>(&self, memory: &'a MemReader, settings: &Settings) -> AssociatedObjects<'a> {
        AssociatedObjects {memory, table: self.associated_objects, idx: 0, limit: settings.max_table_entries, done: self.associated_objects == 0}
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceTableRecord {
    pub id: i32,
    pub vtable_size: u32,
    pub vtable: usize,
}
impl InterfaceTableRecord {
    pub fn is_empty_slot(&self) -> bool { self.id == INVALID_INTERFACE_ID }
}

// Lazy, restartable (Clone) walk over the interface table. Stops after the first read failure.
// A declared size over the limit yields the first `len` records, then an ImplausibleLength error.
#[derive(Clone)]
pub struct InterfaceTable<'a> {
    memory: &'a MemReader,
    addr: usize,
    len: usize,
    declared: usize,
    idx: usize,
    failed: bool,
}
impl<'a> Iterator for InterfaceTable<'a> {
    type Item = Result<InterfaceTableRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.idx >= self.len {
            if self.declared > self.len {
                self.failed = true;
                return Some(err_at!(ImplausibleLength, self.addr, "interface table size {} is over the limit of {}", self.declared, self.len));
            }
            return None;
        }
        let r = self.addr.wrapping_add(self.idx * interface_table_record::SIZE);
        self.idx += 1;
        let mut b = [0u8; interface_table_record::SIZE];
        if let Err(e) = self.memory.read(r, &mut b) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(InterfaceTableRecord {id: field_i32(&b, interface_table_record::ID), vtable_size: field_u32(&b, interface_table_record::VTABLE_SIZE), vtable: field_usize(&b, interface_table_record::VTABLE)}))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssociatedObject {
    pub key: usize, // TypeInfo of the key class
    pub factory: usize, // function in the target
}

// Null-key-terminated table. Iteration stops at the terminator, on the first read error, or after `limit` entries
// (reported as an ImplausibleLength error, in case the terminator is missing).
#[derive(Clone)]
pub struct AssociatedObjects<'a> {
    memory: &'a MemReader,
    table: usize,
    idx: usize,
    limit: usize,
    done: bool,
}
impl<'a> Iterator for AssociatedObjects<'a> {
    type Item = Result<AssociatedObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.idx >= self.limit {
            self.done = true;
            return Some(err_at!(ImplausibleLength, self.table, "associated objects table has no terminator within {} entries", self.limit));
        }
        let r = self.table.wrapping_add(self.idx * associated_object_record::SIZE);
        self.idx += 1;
        let mut b = [0u8; associated_object_record::SIZE];
        if let Err(e) = self.memory.read(r, &mut b) {
            self.done = true;
            return Some(Err(e));
        }
        let key = field_usize(&b, associated_object_record::KEY);
        if key == 0 {
            self.done = true;
            return None;
        }
        Some(Ok(AssociatedObject {key, factory: field_usize(&b, associated_object_record::FACTORY)}))
    }
}

#[derive(Clone, Debug)]
pub struct ExtendedTypeDescriptor {
    pub addr: usize,
    // Negated RuntimeKind of the element for array types.
    pub fields_count: i32,
    pub field_offsets: usize,
    pub field_types: usize,
    pub field_names: usize,
    pub debug_operations_count: i32,
    pub debug_operations: usize,
}

pub fn read_extended_type_descriptor(memory: &MemReader, addr: usize, settings: &Settings) -> Result<ExtendedTypeDescriptor> {
    use crate::layout::extended_type_info::*;
    if addr % POINTER_SIZE != 0 {
        return err_at!(CorruptDescriptor, addr, "misaligned extended type info");
    }
    let mut b = [0u8; SIZE];
    memory.read(addr, &mut b).map_err(|e| e.at(addr))?;
    let r = ExtendedTypeDescriptor {
        addr,
        fields_count: field_i32(&b, FIELDS_COUNT),
        field_offsets: field_usize(&b, FIELD_OFFSETS),
        field_types: field_usize(&b, FIELD_TYPES),
        field_names: field_usize(&b, FIELD_NAMES),
        debug_operations_count: field_i32(&b, DEBUG_OPERATIONS_COUNT),
        debug_operations: field_usize(&b, DEBUG_OPERATIONS),
    };
    if r.fields_count > 0 {
        if r.fields_count as usize > settings.max_fields {
            return err_at!(ImplausibleLength, addr, "too many fields: {}", r.fields_count);
        }
        if r.field_offsets == 0 || r.field_types == 0 {
            return err_at!(CorruptDescriptor, addr, "{} fields but no offsets/types table", r.fields_count);
        }
    }
    if r.debug_operations_count < 0 || (r.debug_operations_count > 0 && r.debug_operations == 0) {
        return err_at!(CorruptDescriptor, addr, "bad debug operations table: {} @0x{:x}", r.debug_operations_count, r.debug_operations);
    }
    Ok(r)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedField {
    pub index: usize,
    pub offset: usize,
    pub kind_code: u8,
    pub name: Option<String>, // None if the names table is absent
}
impl ExtendedField {
    pub fn kind(&self) -> Result<RuntimeKind> { RuntimeKind::from_code(self.kind_code as i64) }
    pub fn display_name(&self) -> String { match &self.name { Some(n) => n.clone(), None => format!("{}", self.index) } }
}

impl ExtendedTypeDescriptor {
    pub fn field_count(&self) -> usize { self.fields_count.max(0) as usize }

    // For array types, the element kind.
    pub fn array_element_kind(&self) -> Option<Result<RuntimeKind>> {
        if self.fields_count >= 0 {
            None
        } else {
            Some(RuntimeKind::from_code(-(self.fields_count as i64)).map_err(|e| e.at(self.addr)))
        }
    }

    // Reads one field's offset, kind code, and name. Doesn't validate the kind code; see ExtendedField::kind().
    pub fn field(&self, memory: &MemReader, index: usize, settings: &Settings) -> Result<ExtendedField> {
        if index >= self.field_count() {
            return err_at!(Usage, self.addr, "field index {} out of range ({} fields)", index, self.field_count());
        }
        let offset = memory.read_i32(self.field_offsets.wrapping_add(index * 4))?;
        if offset < 0 {
            return err_at!(CorruptDescriptor, self.addr, "negative offset of field {}: {}", index, offset);
        }
        let kind_code = memory.read_u8(self.field_types.wrapping_add(index))?;
        let name = if self.field_names == 0 {
            None
        } else {
            let p = memory.read_usize(self.field_names.wrapping_add(index * POINTER_SIZE))?;
            if p == 0 { None } else { Some(memory.read_cstring(p, settings.max_cstring_len)?) }
        };
        Ok(ExtendedField {index, offset: offset as usize, kind_code, name})
    }

    pub fn fields<'a>(&self, memory: &'a MemReader, settings: &'a Settings) -> ExtendedFields<'a> {
        ExtendedFields {ext: self.clone(), memory, settings, idx: 0}
    }

    pub fn find_field(&self, memory: &MemReader, name: &str, settings: &Settings) -> Result<Option<ExtendedField>> {
        for f in self.fields(memory, settings) {
            let f = f?;
            if f.name.as_deref() == Some(name) {
                return Ok(Some(f));
            }
        }
        Ok(None)
    }

    pub fn debug_operations<'a>(&self, memory: &'a MemReader, settings: &Settings) -> DebugOperations<'a> {
        let declared = self.debug_operations_count.max(0) as usize;
        let len = declared.min(settings.max_table_entries);
        DebugOperations {memory, table: self.debug_operations, len, declared, idx: 0, done: declared == 0}
    }
}

// One item per field; a field whose record can't be read yields an error, and iteration continues with the next one.
#[derive(Clone)]
pub struct ExtendedFields<'a> {
    ext: ExtendedTypeDescriptor,
    memory: &'a MemReader,
    settings: &'a Settings,
    idx: usize,
}
impl<'a> Iterator for ExtendedFields<'a> {
    type Item = Result<ExtendedField>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.ext.field_count() {
            return None;
        }
        self.idx += 1;
        Some(self.ext.field(self.memory, self.idx - 1, self.settings))
    }
}

// Function pointers of the helpers the runtime exposes for debuggers. Bounded by the declared count,
// and also stops at a null entry. A count over the limit ends with an ImplausibleLength error.
#[derive(Clone)]
pub struct DebugOperations<'a> {
    memory: &'a MemReader,
    table: usize,
    len: usize,
    declared: usize,
    idx: usize,
    done: bool,
}
impl<'a> Iterator for DebugOperations<'a> {
    type Item = Result<(/*index*/ usize, /*function*/ usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.idx >= self.len {
            self.done = true;
            if self.declared > self.len {
                return Some(err_at!(ImplausibleLength, self.table, "{} debug operations is over the limit of {}", self.declared, self.len));
            }
            return None;
        }
        let i = self.idx;
        self.idx += 1;
        match self.memory.read_usize(self.table.wrapping_add(i * POINTER_SIZE)) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(f) => Some(Ok((i, f))),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// Type-only introspection for "print type of" style commands.
pub struct TypeDescription {
    pub descriptor: TypeDescriptor,
    pub package_name: Option<String>,
    pub relative_name: Option<String>,
    // Starting from the direct supertype. (address, qualified name)
    pub supertypes: Vec<(usize, String)>,
    // Why the supertype chain stopped early, if it did.
    pub supertypes_error: Option<Error>,
    // Implemented interfaces: (address, qualified name).
    pub interfaces: Vec<(usize, String)>,
    pub fields: Vec<Result<ExtendedField>>,
    pub element_kind: Option<Result<RuntimeKind>>,
    pub debug_operations: usize,
}

impl TypeDescription {
    pub fn qualified_name(&self) -> String {
        qualified_name(self.package_name.as_deref(), self.relative_name.as_deref())
    }
}

pub fn qualified_name(package: Option<&str>, relative: Option<&str>) -> String {
    match (package, relative) {
        (Some(p), Some(r)) if !p.is_empty() => format!("{}.{}", p, r),
        (_, Some(r)) => r.to_string(),
        (Some(p), None) if !p.is_empty() => format!("{}.<anonymous>", p),
        _ => "<anonymous>".to_string(),
    }
}

// Package and relative names of a type. Missing names are None; unreadable names are errors.
pub fn read_type_names(memory: &MemReader, t: &TypeDescriptor, settings: &Settings) -> Result<(Option<String>, Option<String>)> {
    let read = |addr: usize| -> Result<Option<String>> {
        if addr == 0 { Ok(None) } else { read_string(memory, addr, settings).map(Some) }
    };
    Ok((read(t.package_name)?, read(t.relative_name)?))
}

pub fn type_name(memory: &MemReader, t: &TypeDescriptor, settings: &Settings) -> Result<String> {
    let (p, r) = read_type_names(memory, t, settings)?;
    Ok(qualified_name(p.as_deref(), r.as_deref()))
}

pub fn describe_type(memory: &MemReader, addr: usize, settings: &Settings) -> Result<TypeDescription> {
    let descriptor = read_type_descriptor(memory, addr)?;
    // A corrupt name pointer only loses that name.
    let read_name = |a: usize| if a == 0 { None } else { read_string(memory, a, settings).ok() };
    let (package_name, relative_name) = (read_name(descriptor.package_name), read_name(descriptor.relative_name));

    let mut supertypes: Vec<(usize, String)> = Vec::new();
    let mut supertypes_error: Option<Error> = None;
    let mut seen: HashSet<usize> = HashSet::new();
    seen.insert(addr);
    let mut cur = descriptor.super_type();
    while let Some(s) = cur {
        if supertypes.len() >= settings.max_supertype_chain || !seen.insert(s) {
            supertypes_error = Some(error!(CorruptDescriptor, "supertype chain doesn't end").at(s));
            break;
        }
        match read_type_descriptor(memory, s) {
            Ok(t) => {
                let name = type_name(memory, &t, settings).unwrap_or_else(|e| e.marker().to_string());
                supertypes.push((s, name));
                cur = t.super_type();
            }
            Err(e) => {
                supertypes_error = Some(e);
                break;
            }
        }
    }

    let interfaces = match descriptor.implemented_interfaces(memory, settings) {
        Ok(v) => v.into_iter().map(|i| {
            let name = read_type_descriptor(memory, i).and_then(|t| type_name(memory, &t, settings));
            (i, name.unwrap_or_else(|e| e.marker().to_string()))
        }).collect(),
        Err(_) => Vec::new(),
    };

    let (fields, element_kind, debug_operations) = match descriptor.extended(memory, settings) {
        Ok(Some(ext)) => (ext.fields(memory, settings).collect(), ext.array_element_kind(), ext.debug_operations(memory, settings).filter(|r| r.is_ok()).count()),
        Ok(None) => (Vec::new(), None, 0),
        Err(e) => (vec![Err(e)], None, 0),
    };

    Ok(TypeDescription {descriptor, package_name, relative_name, supertypes, supertypes_error, interfaces, fields, element_kind, debug_operations})
}

impl fmt::Display for TypeDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let d = &self.descriptor;
        writeln!(f, "{} @0x{:x}", self.qualified_name(), d.addr)?;
        match d.instance_size {
            InstanceSize::Fixed(s) => writeln!(f, "  size: {} bytes", s)?,
            InstanceSize::ArrayElement(s) => match &self.element_kind {
                Some(Ok(k)) => writeln!(f, "  array of {} ({} bytes each)", k.name(), s)?,
                _ => writeln!(f, "  array of {}-byte elements", s)?,
            }
        }
        writeln!(f, "  class id: {}", d.class_id)?;
        let flags = d.flags().readable();
        if !flags.is_empty() {
            writeln!(f, "  flags: {}", flags)?;
        }
        if !self.supertypes.is_empty() || self.supertypes_error.is_some() {
            write!(f, "  supertypes:")?;
            for (i, (_, name)) in self.supertypes.iter().enumerate() {
                write!(f, "{} {}", if i == 0 {""} else {" <-"}, name)?;
            }
            if let Some(e) = &self.supertypes_error {
                write!(f, " {}", e.marker())?;
            }
            writeln!(f)?;
        }
        if !self.interfaces.is_empty() {
            writeln!(f, "  interfaces: {}", self.interfaces.iter().map(|i| i.1.as_str()).collect::<Vec<_>>().join(", "))?;
        }
        if self.debug_operations != 0 {
            writeln!(f, "  debug operations: {}", self.debug_operations)?;
        }
        for field in &self.fields {
            match field {
                Ok(x) => {
                    let kind = match x.kind() { Ok(k) => k.name(), Err(_) => "<unrepresentable kind>" };
                    writeln!(f, "  +{}: {}: {}", x.offset, x.display_name(), kind)?;
                }
                Err(e) => writeln!(f, "  {}", e.marker())?,
            }
        }
        Ok(())
    }
}
