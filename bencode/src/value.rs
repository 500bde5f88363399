// A decoded bencode term. Byte strings stay raw; anything that looks like
// UTF-8 is the caller's business.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self { Value::Bytes(b) }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self { Value::Bytes(b.to_vec()) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Bytes(s.as_bytes().to_vec()) }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self { Value::List(l) }
}

impl From<Dict> for Value {
    fn from(d: Dict) -> Self { Value::Dict(d) }
}

// A dictionary is encoded as d<contents>e with keys in lexicographical order.
// The decoder keeps the original key order so that re-encoding a decoded
// dictionary (the info dictionary in particular) is byte-identical even when
// the source was not sorted; dictionaries built by hand encode sorted.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Dict {
    entries: Vec<(Vec<u8>, Value)>,
    order_preserving: bool,
}

impl Dict {

    pub fn new() -> Self {
        Self::default()
    }

    // Constructor used by the decoder.
    pub(crate) fn order_preserving(entries: Vec<(Vec<u8>, Value)>) -> Self {
        Self { entries, order_preserving: true }
    }

    pub fn preserves_order(&self) -> bool {
        self.order_preserving
    }

    // Inserts a key, replacing an existing entry in place.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Bytes(b) => {
                if let Ok(s) = std::str::from_utf8(b) {
                    write!(f, "{:?}", s)
                } else {
                    write!(f, "<{} bytes>", b.len())
                }
            },
            Value::List(l) => f.debug_list().entries(l.iter()).finish(),
            Value::Dict(d) => write!(f, "{:?}", d),
        }
    }
}

impl std::fmt::Debug for Dict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            map.entry(&String::from_utf8_lossy(k), v);
        }
        map.finish()
    }
}
