use crate::{*, error::*, layout::*, procfs::*, settings::*, types::*, object::*};
use std::sync::Arc;

// Entry point for consumers: target memory plus settings, ABI-checked once at construction.
// Holds no state between calls; every call reads the target afresh.
pub struct Inspector {
    pub memory: MemReader,
    pub settings: Arc<Settings>,
}

impl Inspector {
    // Trusts that the target's runtime matches layout::ABI_REVISION.
    pub fn new(memory: MemReader, settings: Arc<Settings>) -> Self { Self {memory, settings} }

    // Reads the runtime's revision marker first and refuses to work with a mismatching runtime.
    pub fn with_abi_marker(memory: MemReader, settings: Arc<Settings>, marker_addr: usize) -> Result<Self> {
        let r = Self::new(memory, settings);
        r.check_abi_revision(marker_addr)?;
        Ok(r)
    }

    pub fn check_abi_revision(&self, marker_addr: usize) -> Result<()> {
        self.memory.check_valid()?;
        let rev = self.memory.read_i32(marker_addr)?;
        if rev != ABI_REVISION {
            return err_at!(UnsupportedAbi, marker_addr, "target runtime has ABI revision {}, expected {}", rev, ABI_REVISION);
        }
        Ok(())
    }

    pub fn resolve_header(&self, addr: usize) -> Result<ResolvedHeader> { resolve_header(&self.memory, addr) }
    pub fn read_type_descriptor(&self, addr: usize) -> Result<TypeDescriptor> { read_type_descriptor(&self.memory, addr) }
    pub fn decode_object(&self, addr: usize) -> Result<DecodedObject> { decode_object(&self.memory, addr, &self.settings) }
    pub fn describe_type(&self, addr: usize) -> Result<TypeDescription> { describe_type(&self.memory, addr, &self.settings) }
    pub fn read_string(&self, addr: usize) -> Result<String> { read_string(&self.memory, addr, &self.settings) }

    // Type description of an object, rather than of a TypeInfo address.
    pub fn describe_object_type(&self, obj: usize) -> Result<TypeDescription> {
        let h = self.resolve_header(obj)?;
        self.describe_type(h.type_info)
    }

    pub fn children<'a>(&'a self, obj: &DecodedObject) -> Result<Children<'a>> { obj.children(&self.memory, &self.settings) }
}

#[cfg(test)]
mod tests {
    use crate::{*, context::*, layout::*, procfs::*, settings::*, testing::*, value::*};
    use std::sync::Arc;

    #[test]
    fn abi_marker() {
        let mut h = HeapBuilder::new();
        let good = h.alloc(4);
        h.put_i32(good, ABI_REVISION);
        let bad = h.alloc(4);
        h.put_i32(bad, ABI_REVISION + 1);
        let m = h.finish();
        let s = Arc::new(Settings::default());
        assert!(Inspector::with_abi_marker(m.clone(), s.clone(), good).is_ok());
        let e = Inspector::with_abi_marker(m.clone(), s.clone(), bad).err().unwrap();
        assert!(e.is_unsupported_abi());
        assert_eq!(e.addr, Some(bad));
        assert!(Inspector::with_abi_marker(m, s.clone(), 0x7000_0000).err().unwrap().is_unreadable_memory());
        assert!(Inspector::with_abi_marker(MemReader::Invalid, s, good).is_err());
    }

    #[test]
    fn one_failure_does_not_affect_other_roots() {
        let mut h = HeapBuilder::new();
        let t = h.type_info(&TypeSpec::default());
        let good = h.object(t, 8);
        let bad = h.object(0x7000_0000, 8);
        let str_ = h.string("abc");
        let m = h.finish();
        let insp = Inspector::new(m, Arc::new(Settings::default()));
        assert!(insp.decode_object(bad).unwrap_err().is_unreadable_memory());
        let o = insp.decode_object(good).unwrap();
        assert_eq!(insp.children(&o).unwrap().count(), 0);
        assert_eq!(insp.read_string(str_).unwrap(), "abc");
        assert_eq!(insp.describe_object_type(str_).unwrap().qualified_name(), "kotlin.String");
        let o = insp.decode_object(str_).unwrap();
        let first = insp.children(&o).unwrap().next().unwrap().unwrap();
        assert_eq!(first.value.unwrap(), FieldValue::Int16('a' as i16));
    }
}
