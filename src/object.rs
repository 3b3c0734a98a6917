use crate::{*, error::*, layout::*, procfs::*, settings::*, types::*, value::*, util::*};

// Decoding of heap objects: header -> type descriptor -> fields or elements.
// Nothing here follows references; children are produced lazily and it's up to the caller whether to recurse.

// The header's first word, after clearing the tag bits, points either at a TypeInfo (whose first word points to itself)
// or at a meta object (whose first word points at the TypeInfo).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderRef {
    Direct(usize),
    Meta(usize),
}

#[derive(Clone, Copy, Debug)]
pub struct ResolvedHeader {
    pub obj: usize,
    pub header: HeaderRef,
    pub type_info: usize,
    // Only if the header goes through a meta object.
    pub meta_flags: Option<MetaFlags>,
}

pub fn resolve_header(memory: &MemReader, obj: usize) -> Result<ResolvedHeader> {
    if obj == 0 {
        return err!(Usage, "null object");
    }
    if obj % POINTER_SIZE != 0 {
        return err_at!(Usage, obj, "misaligned object address");
    }
    let word = memory.read_usize(obj + obj_header::TYPE_INFO_OR_META)?;
    let p = word & !OBJECT_TAG_MASK;
    if p == 0 {
        return err_at!(CorruptDescriptor, obj, "object header has null type info");
    }
    let first = memory.read_usize(p)?;
    if first == p {
        return Ok(ResolvedHeader {obj, header: HeaderRef::Direct(p), type_info: p, meta_flags: None});
    }
    // Not a TypeInfo. It's a meta object only if its first word leads to one; otherwise p is a TypeInfo with a broken
    // self-reference (or garbage), and we stop without reading anything else there.
    let is_meta = first != 0 && first % type_info::ALIGNMENT == 0 && match memory.read_usize(first + type_info::SELF) {
        Ok(x) => x == first,
        Err(_) => false,
    };
    if !is_meta {
        return err_at!(CorruptDescriptor, p, "type info self-reference mismatch: 0x{:x}", first);
    }
    let flags = memory.read_u32(p + meta_header::FLAGS)?;
    Ok(ResolvedHeader {obj, header: HeaderRef::Meta(p), type_info: first, meta_flags: Some(MetaFlags::from_bits_truncate(flags))})
}

#[derive(Clone, Debug)]
pub enum ObjectBody {
    // Size including the header.
    Scalar {size: usize},
    Array {count: usize, element_size: usize, element_kind: RuntimeKind},
}

#[derive(Clone, Debug)]
pub struct DecodedObject {
    pub addr: usize,
    pub header: ResolvedHeader,
    pub type_: TypeDescriptor,
    pub extended: Option<ExtendedTypeDescriptor>,
    pub body: ObjectBody,
}

pub fn decode_object(memory: &MemReader, addr: usize, settings: &Settings) -> Result<DecodedObject> {
    let header = resolve_header(memory, addr)?;
    let type_ = read_type_descriptor(memory, header.type_info)?;
    let extended = type_.extended(memory, settings)?;
    let body = match type_.instance_size {
        InstanceSize::Fixed(size) => ObjectBody::Scalar {size},
        InstanceSize::ArrayElement(element_size) => {
            let element_kind = array_element_kind(&type_, extended.as_ref())?;
            let count = memory.read_u32(addr + array_header::COUNT)? as usize;
            check_array_extent(memory, addr, count, element_size, settings)?;
            ObjectBody::Array {count, element_size, element_kind}
        }
    };
    Ok(DecodedObject {addr, header, type_, extended, body})
}

fn array_element_kind(t: &TypeDescriptor, extended: Option<&ExtendedTypeDescriptor>) -> Result<RuntimeKind> {
    let element_size = t.element_size()?;
    if let Some(k) = extended.and_then(|e| e.array_element_kind()) {
        let k = k?;
        if k.size() != element_size as i32 {
            return err_at!(CorruptDescriptor, t.addr, "array element kind {} doesn't match element size {}", k.name(), element_size);
        }
        return Ok(k);
    }
    // No extended info. Reference arrays are the ones the GC needs to scan.
    if t.obj_offsets_count > 0 && element_size == POINTER_SIZE {
        Ok(RuntimeKind::Object)
    } else {
        Ok(RuntimeKind::guess_primitive_by_size(element_size))
    }
}

// Rejects counts whose payload can't fit in the mapping containing the array (or in max_array_bytes, if the mapping is unknown).
fn check_array_extent(memory: &MemReader, addr: usize, count: usize, element_size: usize, settings: &Settings) -> Result<()> {
    let total = match count.checked_mul(element_size).and_then(|n| n.checked_add(array_header::SIZE)) {
        Some(n) => n,
        None => return err_at!(ImplausibleLength, addr, "array length overflows: {} x {}", count, element_size),
    };
    let bound = match memory.readable_extent(addr) {
        Some(n) => n,
        None => settings.max_array_bytes.saturating_add(array_header::SIZE),
    };
    if total > bound {
        return err_at!(ImplausibleLength, addr, "array of {} x {} bytes doesn't fit in {} of readable memory", count, element_size, PrettySize(bound));
    }
    Ok(())
}

// Reads one value of the given kind. For references, also checks that the pointee's header is readable,
// so that a dangling reference shows up as an error on this field rather than later.
pub fn read_value(memory: &MemReader, addr: usize, kind: RuntimeKind) -> Result<FieldValue> {
    if kind == RuntimeKind::Invalid {
        return Ok(FieldValue::Unrepresentable(kind.code()));
    }
    let size = kind.byte_size()?;
    let mut buf = [0u8; 16];
    memory.read(addr, &mut buf[..size])?;
    let v = format_value(kind, &buf[..size])?;
    if let FieldValue::Reference(p) = v {
        memory.read_usize(p)?;
    }
    Ok(v)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildName {
    Field(String),
    // Array element, or extended field without a name.
    Index(usize),
    // Reference field known only by its offset (no extended info).
    Offset(usize),
    // The rest of a scalar object without extended info.
    Opaque,
}

impl std::fmt::Display for ChildName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ChildName::Field(s) => write!(f, "{}", s),
            ChildName::Index(i) => write!(f, "[{}]", i),
            ChildName::Offset(o) => write!(f, "+{}", o),
            ChildName::Opaque => write!(f, "<bytes>"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Child {
    pub name: ChildName,
    pub kind: RuntimeKind,
    pub addr: usize,
    pub value: Result<FieldValue>,
}

#[derive(Clone)]
enum ChildSource {
    Fields {ext: ExtendedTypeDescriptor, size: usize, type_addr: usize},
    Offsets {offsets: Vec<usize>, size: usize},
    Elements {count: usize, element_size: usize, kind: RuntimeKind},
}

// Lazy, restartable sequence of an object's fields or elements. Each item is read when it's asked for.
// Err items mean the descriptor entry for that slot couldn't be read; errors reading the value itself are in Child::value.
#[derive(Clone)]
pub struct Children<'a> {
    memory: &'a MemReader,
    settings: &'a Settings,
    obj: usize,
    source: ChildSource,
    idx: usize,
}

impl DecodedObject {
    pub fn is_array(&self) -> bool { match self.body { ObjectBody::Array {..} => true, ObjectBody::Scalar {..} => false } }

    pub fn array_count(&self) -> Option<usize> { match self.body { ObjectBody::Array {count, ..} => Some(count), ObjectBody::Scalar {..} => None } }

    pub fn type_name(&self, memory: &MemReader, settings: &Settings) -> Result<String> { type_name(memory, &self.type_, settings) }

    pub fn children<'a>(&self, memory: &'a MemReader, settings: &'a Settings) -> Result<Children<'a>> {
        let source = match (&self.body, &self.extended) {
            (&ObjectBody::Array {count, element_size, element_kind}, _) => ChildSource::Elements {count, element_size, kind: element_kind},
            (&ObjectBody::Scalar {size}, Some(ext)) => ChildSource::Fields {ext: ext.clone(), size, type_addr: self.type_.addr},
            (&ObjectBody::Scalar {size}, None) => ChildSource::Offsets {offsets: self.type_.obj_offsets(memory, settings)?, size},
        };
        Ok(Children {memory, settings, obj: self.addr, source, idx: 0})
    }

    // Address of element i of an array. No bounds check beyond the count.
    pub fn element_addr(&self, i: usize) -> Result<usize> {
        match self.body {
            ObjectBody::Array {count, element_size, ..} if i < count => Ok(self.addr.wrapping_add(array_header::SIZE + i * element_size)),
            ObjectBody::Array {count, ..} => err!(Usage, "index {} out of range ({} elements)", i, count),
            ObjectBody::Scalar {..} => err_at!(TypeMismatch, self.addr, "not an array"),
        }
    }

    // Looks up a field by name in the extended descriptor and reads it.
    pub fn field(&self, memory: &MemReader, name: &str, settings: &Settings) -> Result<Option<Child>> {
        if self.is_array() || self.extended.is_none() {
            return Ok(None);
        }
        for c in self.children(memory, settings)? {
            let c = c?;
            if let ChildName::Field(n) = &c.name {
                if n == name {
                    return Ok(Some(c));
                }
            }
        }
        Ok(None)
    }
}

impl<'a> Children<'a> {
    pub fn len(&self) -> usize {
        match &self.source {
            ChildSource::Fields {ext, ..} => ext.field_count(),
            ChildSource::Offsets {offsets, size} => offsets.len() + if *size > obj_header::SIZE {1} else {0},
            ChildSource::Elements {count, ..} => *count,
        }
    }

    fn field_child(&self, ext: &ExtendedTypeDescriptor, size: usize, type_addr: usize, i: usize) -> Result<Child> {
        let f = ext.field(self.memory, i, self.settings)?;
        let kind = f.kind();
        let name = match f.name {
            Some(n) => ChildName::Field(n),
            None => ChildName::Index(i),
        };
        let addr = self.obj.wrapping_add(f.offset);
        let kind = match kind {
            Ok(k) => k,
            Err(_) => return Ok(Child {name, kind: RuntimeKind::Invalid, addr, value: Ok(FieldValue::Unrepresentable(f.kind_code))}),
        };
        let value = if kind != RuntimeKind::Invalid && f.offset.saturating_add(kind.size().max(0) as usize) > size {
            err_at!(CorruptDescriptor, type_addr, "field {} at offset {} is outside the {}-byte object", name, f.offset, size)
        } else {
            read_value(self.memory, addr, kind)
        };
        Ok(Child {name, kind, addr, value})
    }
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<Child>;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.idx;
        if i >= self.len() {
            return None;
        }
        self.idx += 1;
        Some(match &self.source {
            ChildSource::Fields {ext, size, type_addr} => self.field_child(ext, *size, *type_addr, i),
            ChildSource::Offsets {offsets, size} => {
                if i < offsets.len() {
                    let off = offsets[i];
                    let addr = self.obj.wrapping_add(off);
                    let value = if off + POINTER_SIZE > *size {
                        err_at!(CorruptDescriptor, self.obj, "reference offset {} is outside the {}-byte object", off, size)
                    } else {
                        read_value(self.memory, addr, RuntimeKind::Object)
                    };
                    Ok(Child {name: ChildName::Offset(off), kind: RuntimeKind::Object, addr, value})
                } else {
                    let addr = self.obj + obj_header::SIZE;
                    let len = *size - obj_header::SIZE;
                    Ok(Child {name: ChildName::Opaque, kind: RuntimeKind::Invalid, addr, value: Ok(FieldValue::Opaque {addr, len})})
                }
            }
            &ChildSource::Elements {element_size, kind, ..} => {
                let addr = self.obj.wrapping_add(array_header::SIZE + i * element_size);
                Ok(Child {name: ChildName::Index(i), kind, addr, value: read_value(self.memory, addr, kind)})
            }
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len().saturating_sub(self.idx);
        (n, Some(n))
    }
}

// Contents of a kotlin.String (or any array of 2-byte elements), at most settings.max_string_chars UTF-16 units.
pub fn read_string(memory: &MemReader, addr: usize, settings: &Settings) -> Result<String> {
    let header = resolve_header(memory, addr)?;
    let t = read_type_descriptor(memory, header.type_info)?;
    match t.instance_size {
        InstanceSize::ArrayElement(2) => (),
        _ => return err_at!(TypeMismatch, addr, "not a string (instance size {})", t.instance_size_raw),
    }
    let count = memory.read_u32(addr + array_header::COUNT)? as usize;
    check_array_extent(memory, addr, count, 2, settings)?;
    let n = count.min(settings.max_string_chars);
    let raw = memory.read_vec(addr + array_header::SIZE, n * 2)?;
    let units: Vec<u16> = raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    let mut s = String::from_utf16_lossy(&units);
    if n < count {
        s.push_str("...");
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use crate::{*, error::*, layout::*, object::*, settings::*, testing::*, value::*};

    fn int_array_type(h: &mut HeapBuilder) -> usize {
        let ext = h.extended_array(RuntimeKind::Int32);
        h.type_info(&TypeSpec {instance_size: -4, extended: ext, ..Default::default()})
    }

    fn values(m: &MemReader, o: &DecodedObject, s: &Settings) -> Vec<FieldValue> {
        o.children(m, s).unwrap().map(|c| c.unwrap().value.unwrap()).collect()
    }

    #[test]
    fn int_array() {
        let mut h = HeapBuilder::new();
        let t = int_array_type(&mut h);
        let a = h.array(t, 3, &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
        let m = h.finish();
        let s = Settings::default();
        let o = decode_object(&m, a, &s).unwrap();
        assert!(o.is_array());
        assert_eq!(o.array_count(), Some(3));
        assert_eq!(values(&m, &o, &s), vec![FieldValue::Int32(1), FieldValue::Int32(2), FieldValue::Int32(3)]);
        let c: Vec<Child> = o.children(&m, &s).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(c[2].name, ChildName::Index(2));
        assert_eq!(c[2].addr, a + 16 + 8);
        assert_eq!(o.element_addr(1).unwrap(), a + 20);
        assert!(o.element_addr(3).is_err());
    }

    #[test]
    fn int_array_without_extended_info() {
        let mut h = HeapBuilder::new();
        let t = h.type_info(&TypeSpec {instance_size: -4, ..Default::default()});
        let a = h.array(t, 2, &[0xff, 0xff, 0xff, 0xff, 7, 0, 0, 0]);
        let m = h.finish();
        let s = Settings::default();
        let o = decode_object(&m, a, &s).unwrap();
        assert_eq!(values(&m, &o, &s), vec![FieldValue::Int32(-1), FieldValue::Int32(7)]);
    }

    #[test]
    fn empty_array() {
        let mut h = HeapBuilder::new();
        let t = int_array_type(&mut h);
        let a = h.array(t, 0, &[]);
        let m = h.finish();
        let s = Settings::default();
        let o = decode_object(&m, a, &s).unwrap();
        assert_eq!(o.children(&m, &s).unwrap().count(), 0);
    }

    #[test]
    fn implausible_count() {
        let mut h = HeapBuilder::new();
        let t = int_array_type(&mut h);
        let a = h.array(t, 1_000_000, &[1, 0, 0, 0]);
        let m = h.finish();
        let e = decode_object(&m, a, &Settings::default()).unwrap_err();
        assert!(e.is_implausible_length());
        assert_eq!(e.addr, Some(a));
    }

    #[test]
    fn element_kind_must_match_size() {
        let mut h = HeapBuilder::new();
        let ext = h.extended_array(RuntimeKind::Int64);
        let t = h.type_info(&TypeSpec {instance_size: -4, extended: ext, ..Default::default()});
        let a = h.array(t, 0, &[]);
        let m = h.finish();
        assert!(decode_object(&m, a, &Settings::default()).unwrap_err().is_corrupt_descriptor());
    }

    #[test]
    fn reference_array() {
        let mut h = HeapBuilder::new();
        let plain = h.type_info(&TypeSpec::default());
        let x = h.object(plain, 8);
        let ext = h.extended_array(RuntimeKind::Object);
        let t = h.type_info(&TypeSpec {instance_size: -8, extended: ext, obj_offsets: vec![0], ..Default::default()});
        let mut payload = Vec::new();
        for p in [x, 0, 0x7000_0000] {
            payload.extend_from_slice(&p.to_le_bytes());
        }
        let a = h.array(t, 3, &payload);
        let m = h.finish();
        let s = Settings::default();
        let o = decode_object(&m, a, &s).unwrap();
        let c: Vec<Child> = o.children(&m, &s).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(c[0].value.as_ref().unwrap(), &FieldValue::Reference(x));
        assert_eq!(c[1].value.as_ref().unwrap(), &FieldValue::Null);
        let e = c[2].value.as_ref().unwrap_err();
        assert!(e.is_unreadable_memory());
        assert_eq!(e.addr, Some(0x7000_0000));
    }

    #[test]
    fn null_reference_field() {
        let mut h = HeapBuilder::new();
        let t = h.type_info(&TypeSpec {instance_size: 16, obj_offsets: vec![8], ..Default::default()});
        let x = h.object(t, 16);
        let m = h.finish();
        let s = Settings::default();
        let o = decode_object(&m, x, &s).unwrap();
        let c: Vec<Child> = o.children(&m, &s).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].name, ChildName::Offset(8));
        assert_eq!(c[0].value.as_ref().unwrap(), &FieldValue::Null);
        assert_eq!(c[1].name, ChildName::Opaque);
        assert_eq!(c[1].value.as_ref().unwrap(), &FieldValue::Opaque {addr: x + 8, len: 8});
    }

    #[test]
    fn dangling_field_does_not_hide_siblings() {
        let mut h = HeapBuilder::new();
        let leaf = h.type_info(&TypeSpec::default());
        let y = h.object(leaf, 8);
        let ext = h.extended(&[(8, RuntimeKind::Object as u8, "bad"), (16, RuntimeKind::Object as u8, "good"), (24, RuntimeKind::Int32 as u8, "n")], &[]);
        let t = h.type_info(&TypeSpec {instance_size: 32, obj_offsets: vec![8, 16], extended: ext, ..Default::default()});
        let x = h.object(t, 32);
        h.put_usize(x + 8, 0x6000_0000);
        h.put_usize(x + 16, y);
        h.put_i32(x + 24, 42);
        let m = h.finish();
        let s = Settings::default();
        let o = decode_object(&m, x, &s).unwrap();
        let c: Vec<Child> = o.children(&m, &s).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(c[0].name, ChildName::Field("bad".to_string()));
        assert!(c[0].value.as_ref().unwrap_err().is_unreadable_memory());
        assert_eq!(c[1].value.as_ref().unwrap(), &FieldValue::Reference(y));
        assert_eq!(c[2].value.as_ref().unwrap(), &FieldValue::Int32(42));
        assert_eq!(o.field(&m, "n", &s).unwrap().unwrap().value.unwrap(), FieldValue::Int32(42));
        assert!(o.field(&m, "missing", &s).unwrap().is_none());
    }

    #[test]
    fn field_outside_object_and_unknown_kind() {
        let mut h = HeapBuilder::new();
        let ext = h.extended(&[(8, RuntimeKind::Int64 as u8, "over"), (8, 77, "odd")], &[]);
        let t = h.type_info(&TypeSpec {instance_size: 12, extended: ext, ..Default::default()});
        let x = h.object(t, 16);
        let m = h.finish();
        let s = Settings::default();
        let o = decode_object(&m, x, &s).unwrap();
        let c: Vec<Child> = o.children(&m, &s).unwrap().map(|c| c.unwrap()).collect();
        assert!(c[0].value.as_ref().unwrap_err().is_corrupt_descriptor());
        assert_eq!(c[1].value.as_ref().unwrap(), &FieldValue::Unrepresentable(77));
    }

    #[test]
    fn children_are_restartable() {
        let mut h = HeapBuilder::new();
        let t = int_array_type(&mut h);
        let a = h.array(t, 2, &[5, 0, 0, 0, 6, 0, 0, 0]);
        let m = h.finish();
        let s = Settings::default();
        let o = decode_object(&m, a, &s).unwrap();
        let mut it = o.children(&m, &s).unwrap();
        assert_eq!(it.len(), 2);
        let _ = it.next();
        let rest = it.clone();
        assert_eq!(it.count(), 1);
        assert_eq!(rest.count(), 1);
    }

    #[test]
    fn meta_wrapper() {
        let mut h = HeapBuilder::new();
        let t = h.type_info(&TypeSpec::default());
        let meta = h.meta(t, MetaFlags::NEVER_FROZEN);
        let x = h.object(meta, 8);
        let y = h.object(t | 1, 8); // tag bit set
        let m = h.finish();
        let r = resolve_header(&m, x).unwrap();
        assert_eq!(r.header, HeaderRef::Meta(meta));
        assert_eq!(r.type_info, t);
        assert_eq!(r.meta_flags, Some(MetaFlags::NEVER_FROZEN));
        let r = resolve_header(&m, y).unwrap();
        assert_eq!(r.header, HeaderRef::Direct(t));
        assert!(r.meta_flags.is_none());
        assert_eq!(decode_object(&m, x, &Settings::default()).unwrap().type_.addr, t);
    }

    #[test]
    fn corrupt_descriptor_aborts_decode() {
        let mut h = HeapBuilder::new();
        let t = h.type_info(&TypeSpec::default());
        let x = h.object(t, 8);
        h.put_usize(t, 0xbad0);
        // Only the self-reference stays mapped, so any further read of the descriptor would fail differently.
        h.truncate(t, 8);
        let m = h.finish();
        let e = decode_object(&m, x, &Settings::default()).unwrap_err();
        assert!(e.is_corrupt_descriptor());
        assert_eq!(e.addr, Some(t));
        assert_eq!(e.marker(), "<corrupt type>");
    }

    #[test]
    fn meta_pointing_at_garbage() {
        let mut h = HeapBuilder::new();
        let junk = h.alloc(16);
        h.put_usize(junk, 0x1234_5678);
        let meta = h.meta(junk, MetaFlags::empty());
        let x = h.object(meta, 8);
        let m = h.finish();
        let e = decode_object(&m, x, &Settings::default()).unwrap_err();
        assert!(e.is_corrupt_descriptor());
        assert_eq!(e.addr, Some(meta));
    }

    #[test]
    fn strings() {
        let mut h = HeapBuilder::new();
        let a = h.string("héllo");
        let e = h.string("");
        let t = int_array_type(&mut h);
        let ints = h.array(t, 0, &[]);
        let m = h.finish();
        let mut s = Settings::default();
        assert_eq!(read_string(&m, a, &s).unwrap(), "héllo");
        assert_eq!(read_string(&m, e, &s).unwrap(), "");
        assert!(read_string(&m, ints, &s).unwrap_err().is_type_mismatch());
        s.max_string_chars = 2;
        assert_eq!(read_string(&m, a, &s).unwrap(), "hé...");
        assert!(read_string(&m, 0, &s).unwrap_err().is_usage());
    }
}
