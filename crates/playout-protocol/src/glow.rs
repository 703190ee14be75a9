/// Glow (Ember+) BER-TLV encoding: the subset a monitoring-only
/// provider needs: qualified nodes and parameters going out, directory
/// requests and write attempts coming in.
///
/// The writer always emits definite lengths. The reader additionally
/// accepts indefinite lengths because deployed consumers emit them.

// Universal tags
const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_UTF8STRING: u8 = 0x0C;
const TAG_RELATIVE_OID: u8 = 0x0D;
const TAG_SET: u8 = 0x31;

/// Constructed context-class tag.
fn context(n: u8) -> u8 {
    0xA0 | n
}

/// Constructed application-class tag.
fn application(n: u8) -> u8 {
    0x60 | n
}

// Application tags from the Glow DTD
const APP_ROOT: u8 = 0;
const APP_PARAMETER: u8 = 1;
const APP_COMMAND: u8 = 2;
const APP_NODE: u8 = 3;
const APP_ELEMENT_COLLECTION: u8 = 4;
const APP_QUALIFIED_PARAMETER: u8 = 9;
const APP_QUALIFIED_NODE: u8 = 10;
const APP_ROOT_ELEMENT_COLLECTION: u8 = 11;

// GlowCommand numbers
pub const COMMAND_SUBSCRIBE: i64 = 30;
pub const COMMAND_UNSUBSCRIBE: i64 = 31;
pub const COMMAND_GET_DIRECTORY: i64 = 32;

// Context tags within parameter/node contents
const CTX_IDENTIFIER: u8 = 0;
const CTX_VALUE: u8 = 2;
const CTX_ACCESS: u8 = 5;
const CTX_ENUMERATION: u8 = 7;
const CTX_TYPE: u8 = 13;

/// Parameter value access: read-only everywhere in this provider.
pub const ACCESS_READ: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ParameterType {
    Integer = 1,
    String = 3,
    Boolean = 4,
    Enum = 6,
}

/// A parameter value in the three shapes this tree carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl Value {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => write_tlv(out, TAG_INTEGER, &integer_bytes(*v)),
            Value::Bool(v) => write_tlv(out, TAG_BOOLEAN, &[if *v { 0xFF } else { 0x00 }]),
            Value::Str(v) => write_tlv(out, TAG_UTF8STRING, v.as_bytes()),
        }
    }
}

// ── BER writer ──

fn write_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    write_len(out, content.len());
    out.extend_from_slice(content);
}

/// Minimal two's-complement big-endian bytes.
fn integer_bytes(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        // A leading byte is redundant when it carries no sign information.
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn relative_oid_bytes(path: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len());
    for &sub in path {
        let mut chunk = [0u8; 5];
        let mut n = 5;
        let mut v = sub;
        loop {
            n -= 1;
            chunk[n] = (v & 0x7F) as u8 | if n == 4 { 0 } else { 0x80 };
            v >>= 7;
            if v == 0 {
                break;
            }
        }
        out.extend_from_slice(&chunk[n..]);
    }
    out
}

// ── Glow element encoders ──

/// Everything a directory listing states about one parameter.
#[derive(Debug, Clone)]
pub struct ParameterSpec<'a> {
    pub path: &'a [u32],
    pub identifier: &'a str,
    pub ptype: ParameterType,
    pub value: Value,
    /// Newline-separated enumeration strings, ordinal order.
    pub enumeration: Option<&'a str>,
}

/// QualifiedNode carrying its identifier.
pub fn qualified_node(path: &[u32], identifier: &str) -> Vec<u8> {
    let mut contents = Vec::new();
    let mut ident = Vec::new();
    write_tlv(&mut ident, TAG_UTF8STRING, identifier.as_bytes());
    write_tlv(&mut contents, context(CTX_IDENTIFIER), &ident);

    let mut set = Vec::new();
    write_tlv(&mut set, TAG_SET, &contents);

    let mut body = Vec::new();
    let mut oid = Vec::new();
    write_tlv(&mut oid, TAG_RELATIVE_OID, &relative_oid_bytes(path));
    write_tlv(&mut body, context(0), &oid);
    write_tlv(&mut body, context(1), &set);

    let mut out = Vec::new();
    write_tlv(&mut out, application(APP_QUALIFIED_NODE), &body);
    out
}

/// QualifiedParameter with full contents, for directory responses.
pub fn qualified_parameter(spec: &ParameterSpec) -> Vec<u8> {
    let mut contents = Vec::new();

    let mut ident = Vec::new();
    write_tlv(&mut ident, TAG_UTF8STRING, spec.identifier.as_bytes());
    write_tlv(&mut contents, context(CTX_IDENTIFIER), &ident);

    let mut value = Vec::new();
    spec.value.write(&mut value);
    write_tlv(&mut contents, context(CTX_VALUE), &value);

    let mut access = Vec::new();
    write_tlv(&mut access, TAG_INTEGER, &integer_bytes(ACCESS_READ));
    write_tlv(&mut contents, context(CTX_ACCESS), &access);

    if let Some(enumeration) = spec.enumeration {
        let mut e = Vec::new();
        write_tlv(&mut e, TAG_UTF8STRING, enumeration.as_bytes());
        write_tlv(&mut contents, context(CTX_ENUMERATION), &e);
    }

    let mut ptype = Vec::new();
    write_tlv(&mut ptype, TAG_INTEGER, &integer_bytes(spec.ptype as i64));
    write_tlv(&mut contents, context(CTX_TYPE), &ptype);

    qualified_parameter_body(spec.path, &contents)
}

/// QualifiedParameter carrying only the value, for change pushes.
pub fn qualified_parameter_value(path: &[u32], value: &Value) -> Vec<u8> {
    let mut contents = Vec::new();
    let mut v = Vec::new();
    value.write(&mut v);
    write_tlv(&mut contents, context(CTX_VALUE), &v);
    qualified_parameter_body(path, &contents)
}

fn qualified_parameter_body(path: &[u32], contents: &[u8]) -> Vec<u8> {
    let mut set = Vec::new();
    write_tlv(&mut set, TAG_SET, contents);

    let mut body = Vec::new();
    let mut oid = Vec::new();
    write_tlv(&mut oid, TAG_RELATIVE_OID, &relative_oid_bytes(path));
    write_tlv(&mut body, context(0), &oid);
    write_tlv(&mut body, context(1), &set);

    let mut out = Vec::new();
    write_tlv(&mut out, application(APP_QUALIFIED_PARAMETER), &body);
    out
}

/// Wrap encoded elements into Root → RootElementCollection.
pub fn root(elements: &[Vec<u8>]) -> Vec<u8> {
    let mut collection = Vec::new();
    for element in elements {
        write_tlv(&mut collection, context(0), element);
    }
    let mut rec = Vec::new();
    write_tlv(&mut rec, application(APP_ROOT_ELEMENT_COLLECTION), &collection);
    let mut out = Vec::new();
    write_tlv(&mut out, application(APP_ROOT), &rec);
    out
}

// ── BER reader ──

#[derive(Debug, Clone, Copy)]
struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
}

/// Read one TLV; returns the TLV and the bytes it consumed. Handles
/// definite lengths up to 4 bytes and indefinite lengths (content runs
/// to the matching end-of-contents marker).
fn read_tlv(data: &[u8]) -> Option<(Tlv<'_>, usize)> {
    if data.len() < 2 {
        return None;
    }
    let tag = data[0];
    if tag & 0x1F == 0x1F {
        // Multi-byte tag numbers never occur in Glow.
        return None;
    }
    let first = data[1];
    if first == 0x80 {
        // Indefinite: walk children until the end-of-contents marker.
        let mut pos = 2;
        loop {
            if pos + 2 > data.len() {
                return None;
            }
            if data[pos] == 0x00 && data[pos + 1] == 0x00 {
                return Some((
                    Tlv {
                        tag,
                        content: &data[2..pos],
                    },
                    pos + 2,
                ));
            }
            let (_, used) = read_tlv(&data[pos..])?;
            pos += used;
        }
    }
    let (len, header) = if first < 0x80 {
        (first as usize, 2)
    } else {
        let n = (first & 0x7F) as usize;
        if n == 0 || n > 4 || data.len() < 2 + n {
            return None;
        }
        let mut len = 0usize;
        for &b in &data[2..2 + n] {
            len = (len << 8) | b as usize;
        }
        (len, 2 + n)
    };
    if data.len() < header + len {
        return None;
    }
    Some((
        Tlv {
            tag,
            content: &data[header..header + len],
        },
        header + len,
    ))
}

fn each_child<'a>(content: &'a [u8]) -> impl Iterator<Item = Tlv<'a>> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        if pos >= content.len() {
            return None;
        }
        // Trailing end-of-contents inside indefinite parents.
        if content[pos] == 0x00 {
            return None;
        }
        let (tlv, used) = read_tlv(&content[pos..])?;
        pos += used;
        Some(tlv)
    })
}

fn find_child<'a>(content: &'a [u8], tag: u8) -> Option<Tlv<'a>> {
    each_child(content).find(|t| t.tag == tag)
}

fn decode_integer(content: &[u8]) -> i64 {
    let mut v: i64 = if content.first().is_some_and(|&b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for &b in content {
        v = (v << 8) | b as i64;
    }
    v
}

fn decode_relative_oid(content: &[u8]) -> Vec<u32> {
    let mut out = Vec::new();
    let mut acc: u32 = 0;
    for &b in content {
        acc = (acc << 7) | (b & 0x7F) as u32;
        if b & 0x80 == 0 {
            out.push(acc);
            acc = 0;
        }
    }
    out
}

/// A decoded consumer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// GetDirectory on the element at `path` (empty = root).
    GetDirectory(Vec<u32>),
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    /// A write attempt on the parameter at `path`.
    SetValue(Vec<u32>),
}

/// Walk one Glow payload and extract every request it carries.
pub fn parse_requests(glow: &[u8]) -> Vec<Request> {
    let mut out = Vec::new();
    let Some((root_tlv, _)) = read_tlv(glow) else {
        return out;
    };
    if root_tlv.tag != application(APP_ROOT) {
        return out;
    }
    let Some(collection) = find_child(root_tlv.content, application(APP_ROOT_ELEMENT_COLLECTION))
    else {
        return out;
    };
    for wrapper in each_child(collection.content) {
        if wrapper.tag != context(0) {
            continue;
        }
        if let Some((element, _)) = read_tlv(wrapper.content) {
            walk_element(element, &[], &mut out);
        }
    }
    out
}

fn walk_element(element: Tlv<'_>, path: &[u32], out: &mut Vec<Request>) {
    if element.tag == application(APP_COMMAND) {
        let Some(number) = find_child(element.content, context(0))
            .and_then(|t| read_tlv(t.content))
            .map(|(v, _)| decode_integer(v.content))
        else {
            return;
        };
        let p = path.to_vec();
        match number {
            COMMAND_GET_DIRECTORY => out.push(Request::GetDirectory(p)),
            COMMAND_SUBSCRIBE => out.push(Request::Subscribe(p)),
            COMMAND_UNSUBSCRIBE => out.push(Request::Unsubscribe(p)),
            _ => {}
        }
        return;
    }

    let qualified =
        element.tag == application(APP_QUALIFIED_NODE) || element.tag == application(APP_QUALIFIED_PARAMETER);
    let numbered = element.tag == application(APP_NODE) || element.tag == application(APP_PARAMETER);
    if !qualified && !numbered {
        return;
    }

    // [0] is a relative-oid path on qualified elements, an integer
    // number on plain ones.
    let mut own_path = path.to_vec();
    if let Some(inner) = find_child(element.content, context(0)).and_then(|t| read_tlv(t.content).map(|(v, _)| v)) {
        if qualified {
            own_path = decode_relative_oid(inner.content);
        } else {
            own_path.push(decode_integer(inner.content) as u32);
        }
    }

    let is_parameter = element.tag == application(APP_QUALIFIED_PARAMETER)
        || element.tag == application(APP_PARAMETER);
    if is_parameter {
        if let Some(contents) = find_child(element.content, context(1)) {
            let set = match read_tlv(contents.content) {
                Some((t, _)) if t.tag == TAG_SET => t.content,
                _ => contents.content,
            };
            if find_child(set, context(CTX_VALUE)).is_some() {
                out.push(Request::SetValue(own_path.clone()));
            }
        }
    }

    // children [2] → ElementCollection of wrapped elements
    if let Some(children) = find_child(element.content, context(2)) {
        if let Some(collection) = find_child(children.content, application(APP_ELEMENT_COLLECTION))
            .or_else(|| read_tlv(children.content).map(|(t, _)| t))
        {
            for wrapper in each_child(collection.content) {
                if wrapper.tag != context(0) {
                    continue;
                }
                if let Some((child, _)) = read_tlv(wrapper.content) {
                    walk_element(child, &own_path, out);
                }
            }
        }
    }
}
