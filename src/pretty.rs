use crate::{*, error::*, log::*, util::*, types::*, object::*, value::*, context::*};
use std::{mem, collections::HashSet};

// Consumer-side rendering: recognizing strings and collections, one-line summaries, and a depth-limited tree printer.
// Traversal policy (depth, cycles, how many children to show) lives here, not in the decoder.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KnownKind {
    String,
    Array,
    List,
    Map,
    Any,
}

pub const STRING_TYPE: &str = "kotlin.String";
// Fields through which list implementations reach their element storage.
pub const LIST_BACKING_FIELDS: [&str; 3] = ["backing", "$this_asList", "backingArray"];
const LIST_NAMES: [&str; 3] = ["kotlin.collections.List", "kotlin.collections.MutableList", "kotlin.collections.ArrayList"];
const MAP_NAMES: [&str; 3] = ["kotlin.collections.Map", "kotlin.collections.MutableMap", "kotlin.collections.HashMap"];

fn has_field(insp: &Inspector, obj: &DecodedObject, name: &str) -> bool {
    match &obj.extended {
        Some(e) => matches!(e.find_field(&insp.memory, name, &insp.settings), Ok(Some(_))),
        None => false,
    }
}

// Whether the type itself, or one of the interfaces it implements, has one of the given names.
fn named_or_implements(insp: &Inspector, obj: &DecodedObject, names: &[&str]) -> bool {
    let (memory, settings) = (&insp.memory, &*insp.settings);
    if let Ok(n) = obj.type_name(memory, settings) {
        if names.contains(&n.as_str()) {
            return true;
        }
    }
    let interfaces = match obj.type_.implemented_interfaces(memory, settings) {
        Ok(v) => v,
        Err(_) => return false,
    };
    interfaces.iter().any(|&i| match read_type_descriptor(memory, i).and_then(|d| type_name(memory, &d, settings)) {
        Ok(n) => names.contains(&n.as_str()),
        Err(_) => false,
    })
}

// Never fails; anything unrecognizable is Any.
pub fn known_kind(insp: &Inspector, obj: &DecodedObject) -> KnownKind {
    if let ObjectBody::Array {element_size, ..} = obj.body {
        if element_size == 2 && matches!(obj.type_name(&insp.memory, &insp.settings), Ok(n) if n == STRING_TYPE) {
            return KnownKind::String;
        }
        return KnownKind::Array;
    }
    if named_or_implements(insp, obj, &MAP_NAMES) || (has_field(insp, obj, "keysArray") && has_field(insp, obj, "valuesArray")) {
        return KnownKind::Map;
    }
    if named_or_implements(insp, obj, &LIST_NAMES) || LIST_BACKING_FIELDS.iter().any(|f| has_field(insp, obj, f)) {
        return KnownKind::List;
    }
    KnownKind::Any
}

fn reference_field(insp: &Inspector, obj: &DecodedObject, name: &str) -> Result<Option<usize>> {
    let c = match obj.field(&insp.memory, name, &insp.settings)? {
        None => return Ok(None),
        Some(c) => c,
    };
    match c.value? {
        FieldValue::Reference(p) => Ok(Some(p)),
        FieldValue::Null => err_at!(Usage, c.addr, "{} is null", name),
        v => err_at!(TypeMismatch, c.addr, "{} is not a reference: {}", name, v),
    }
}

fn int_field(insp: &Inspector, obj: &DecodedObject, name: &str) -> Option<i64> {
    match obj.field(&insp.memory, name, &insp.settings) {
        Ok(Some(Child {value: Ok(v), ..})) => v.as_i64(),
        _ => None,
    }
}

fn array_object(insp: &Inspector, addr: usize) -> Result<DecodedObject> {
    let o = insp.decode_object(addr)?;
    if !o.is_array() {
        return err_at!(TypeMismatch, addr, "not an array");
    }
    Ok(o)
}

// (backing array, first element, number of elements)
fn list_backing(insp: &Inspector, obj: &DecodedObject) -> Result<(DecodedObject, usize, usize)> {
    for name in LIST_BACKING_FIELDS {
        let p = match reference_field(insp, obj, name)? {
            None => continue,
            Some(p) => p,
        };
        let backing = array_object(insp, p)?;
        let count = backing.array_count().unwrap_or(0);
        // ArrayList keeps spare capacity in the backing array.
        let start = int_field(insp, obj, "offset").map_or(0, |x| (x.max(0) as usize).min(count));
        let len = int_field(insp, obj, "length").map_or(count - start, |x| (x.max(0) as usize).min(count - start));
        return Ok((backing, start, len));
    }
    err_at!(Usage, obj.addr, "couldn't find backing for list")
}

pub type Elements<'a> = std::iter::Take<std::iter::Skip<Children<'a>>>;
pub type MapEntries<'a> = std::iter::Zip<Children<'a>, Children<'a>>;

// Elements of an array or a list.
pub fn list_elements<'a>(insp: &'a Inspector, addr: usize) -> Result<Elements<'a>> {
    let obj = insp.decode_object(addr)?;
    let (backing, start, len) = match known_kind(insp, &obj) {
        KnownKind::Array => {
            let n = obj.array_count().unwrap_or(0);
            (obj, 0, n)
        }
        KnownKind::List => list_backing(insp, &obj)?,
        _ => return err_at!(TypeMismatch, addr, "not a list"),
    };
    Ok(insp.children(&backing)?.skip(start).take(len))
}

// (key, value) pairs, index-aligned between the map's keys and values arrays.
pub fn map_entries<'a>(insp: &'a Inspector, addr: usize) -> Result<MapEntries<'a>> {
    let obj = insp.decode_object(addr)?;
    let keys = reference_field(insp, &obj, "keysArray")?;
    let values = reference_field(insp, &obj, "valuesArray")?;
    let (keys, values) = match (keys, values) {
        (Some(k), Some(v)) => (array_object(insp, k)?, array_object(insp, v)?),
        _ => return err_at!(Usage, addr, "couldn't find backing for map"),
    };
    Ok(insp.children(&keys)?.zip(insp.children(&values)?))
}

fn plural(n: usize, one: &str, many: &str) -> String {
    if n == 1 { format!("1 {}", one) } else { format!("{} {}", n, many) }
}

// One-line description of an object. Errors are rendered as markers.
pub fn summarize(insp: &Inspector, addr: usize) -> String {
    if addr == 0 {
        return "null".to_string();
    }
    let obj = match insp.decode_object(addr) {
        Ok(o) => o,
        Err(e) => return e.marker().to_string(),
    };
    let any = |obj: &DecodedObject| -> String {
        let name = obj.type_name(&insp.memory, &insp.settings).unwrap_or_else(|e| e.marker().to_string());
        format!("{}@0x{:x}", name, addr)
    };
    match known_kind(insp, &obj) {
        KnownKind::String => match insp.read_string(addr) {
            Ok(s) => format!("\"{}\"", s),
            Err(e) => e.marker().to_string(),
        }
        KnownKind::Array => plural(obj.array_count().unwrap_or(0), "value", "values"),
        KnownKind::List => match list_backing(insp, &obj) {
            Ok((_, _, n)) => plural(n, "value", "values"),
            Err(_) => any(&obj),
        }
        KnownKind::Map => match map_entries(insp, addr) {
            Ok(e) => plural(e.size_hint().0, "key/value pair", "key/value pairs"),
            Err(_) => any(&obj),
        }
        KnownKind::Any => any(&obj),
    }
}

// Follows named reference fields, e.g. "head.next.value". Needs extended type info on every object along the way.
pub fn field_by_path(insp: &Inspector, addr: usize, path: &str) -> Result<Child> {
    let mut cur = addr;
    let mut parts = path.split('.').peekable();
    while let Some(name) = parts.next() {
        let obj = insp.decode_object(cur)?;
        let c = match obj.field(&insp.memory, name, &insp.settings)? {
            Some(c) => c,
            None => return err_at!(Usage, cur, "<NO_FIELD_FOUND>: no field '{}' in {}", name, obj.type_name(&insp.memory, &insp.settings).unwrap_or_else(|e| e.marker().to_string())),
        };
        if parts.peek().is_none() {
            return Ok(c);
        }
        cur = match &c.value {
            Ok(FieldValue::Reference(p)) => *p,
            Ok(FieldValue::Null) => return err_at!(Usage, c.addr, "'{}' is null", name),
            Ok(v) => return err_at!(TypeMismatch, c.addr, "'{}' is not a reference: {}", name, v),
            Err(e) => return Err(e.clone()),
        };
    }
    err!(Usage, "empty field path")
}

// Renders an object graph as indented text. Each object is expanded at most once per print() call;
// repeated references (including cycles) are shown as summaries only.
pub struct TreePrinter<'a> {
    insp: &'a Inspector,
    pub flags: DisplayFlags,
    // Warnings about things that couldn't be shown.
    pub log: Log,
    // Why the last print() couldn't decode its root object, if it couldn't. Null roots aren't errors.
    pub root_error: Option<Error>,
    limiter: Limiter,
    visited: HashSet<usize>,
    out: String,
}

impl<'a> TreePrinter<'a> {
    pub fn new(insp: &'a Inspector) -> Self {
        Self {insp, flags: DisplayFlags::empty(), log: Log::new(), root_error: None, limiter: Limiter::new(), visited: HashSet::new(), out: String::new()}
    }

    pub fn print(&mut self, addr: usize) -> String {
        self.visited.clear();
        self.out.clear();
        self.root_error = None;
        let root = summarize(self.insp, addr);
        self.line(0, &root);
        if addr != 0 {
            match self.insp.decode_object(addr) {
                Ok(obj) => if self.insp.settings.print_depth >= 1 {
                    self.visited.insert(addr);
                    self.expand_object(&obj, 1);
                }
                Err(e) => {
                    self.warn(&e);
                    self.root_error = Some(e);
                }
            }
        }
        mem::take(&mut self.out)
    }

    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn warn(&mut self, e: &Error) {
        log!(self.log, "{}", e);
    }

    fn value_text(&mut self, value: &Result<FieldValue>) -> String {
        match value {
            Ok(FieldValue::Reference(p)) => {
                let s = summarize(self.insp, *p);
                if self.visited.contains(p) { format!("{} (shown above)", s) } else { s }
            }
            Ok(v) => v.format_with(self.flags),
            Err(e) => {
                self.warn(e);
                e.marker().to_string()
            }
        }
    }

    fn expand(&mut self, addr: usize, depth: usize) {
        if depth > self.insp.settings.print_depth || !self.visited.insert(addr) {
            return;
        }
        match self.insp.decode_object(addr) {
            Ok(obj) => self.expand_object(&obj, depth),
            Err(e) => self.warn(&e),
        }
    }

    fn expand_object(&mut self, obj: &DecodedObject, depth: usize) {
        let insp = self.insp;
        let addr = obj.addr;
        match known_kind(insp, obj) {
            KnownKind::String => (),
            KnownKind::Map => match map_entries(insp, addr) {
                Ok(entries) => self.entries(entries, depth),
                Err(e) => self.fallback(obj, e, depth),
            }
            KnownKind::List | KnownKind::Array => match list_elements(insp, addr) {
                Ok(elements) => self.children(elements, depth),
                Err(e) => self.fallback(obj, e, depth),
            }
            KnownKind::Any => match insp.children(obj) {
                Ok(c) => self.children(c, depth),
                Err(e) => {
                    self.line(depth, e.marker());
                    self.warn(&e);
                }
            }
        }
    }

    // Collection that doesn't look the way we expect. Show its raw fields instead.
    fn fallback(&mut self, obj: &DecodedObject, e: Error, depth: usize) {
        if self.limiter.check(line!()) {
            eprintln!("warning: {}; showing raw fields", e);
        }
        self.warn(&e);
        match self.insp.children(obj) {
            Ok(c) => self.children(c, depth),
            Err(e) => self.warn(&e),
        }
    }

    fn too_many(&mut self, shown: usize, total: usize, depth: usize) {
        self.line(depth, &format!("... {} more", total.saturating_sub(shown)));
        log!(self.log, "showing only {} of {} children", shown, total);
    }

    fn children<I: Iterator<Item = Result<Child>>>(&mut self, it: I, depth: usize) {
        let max = self.insp.settings.print_max_children;
        let total = it.size_hint().0;
        for (i, c) in it.enumerate() {
            if i >= max {
                self.too_many(max, total, depth);
                break;
            }
            let c = match c {
                Ok(c) => c,
                Err(e) => {
                    self.line(depth, &format!("[{}]: {}", i, e.marker()));
                    self.warn(&e);
                    continue;
                }
            };
            let text = format!("{}: {}", c.name, self.value_text(&c.value));
            self.line(depth, &text);
            if let Ok(FieldValue::Reference(p)) = c.value {
                self.expand(p, depth + 1);
            }
        }
    }

    fn entries(&mut self, it: MapEntries, depth: usize) {
        let max = self.insp.settings.print_max_children;
        let total = it.size_hint().0;
        for (i, (k, v)) in it.enumerate() {
            if i >= max {
                self.too_many(max, total, depth);
                break;
            }
            let k = match k { Ok(c) => self.value_text(&c.value), Err(e) => { self.warn(&e); e.marker().to_string() } };
            let v = match v { Ok(c) => self.value_text(&c.value), Err(e) => { self.warn(&e); e.marker().to_string() } };
            self.line(depth, &format!("[{}]: {} -> {}", i, k, v));
        }
    }
}
