use crate::error::{Error, Result};
use crate::value::{Dict, Value};


// Decodes a single bencoded value from the front of the input. Trailing bytes
// are ignored; use a Decoder directly when the cursor position matters.
pub fn decode(data: &[u8]) -> Result<Value> {
    Decoder::new(data).decode_value()
}

// Streaming decoder over a byte slice. Exposes its read offset because the
// ut_metadata data message piggybacks raw bytes directly after a bencoded
// header; the tail starts wherever the cursor stops.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {

    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    // Current read offset into the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    // Everything after the last decoded value.
    pub fn remainder(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn decode_value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                self.decode_int().map(Value::Int)
            },
            b'0'..=b'9' => self.decode_bytes().map(Value::Bytes),
            b'l' => {
                self.pos += 1;
                self.decode_list().map(Value::List)
            },
            b'd' => {
                self.pos += 1;
                self.decode_dict().map(Value::Dict)
            },
            byte => Err(Error::UnknownToken { byte, offset: self.pos }),
        }
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(Error::Truncated(self.pos))
    }

    // i<signed decimal>e
    fn decode_int(&mut self) -> Result<i64> {
        let start = self.pos;
        let end = self.find(b'e').ok_or(Error::Truncated(self.data.len()))?;

        let literal = std::str::from_utf8(&self.data[start..end])
            .map_err(|_| Error::InvalidInteger(start))?;
        let int = literal.parse().map_err(|_| Error::InvalidInteger(start))?;

        self.pos = end + 1;
        Ok(int)
    }

    // <decimal length>:<raw bytes>
    fn decode_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let colon = self.find(b':').ok_or(Error::Truncated(self.data.len()))?;

        let digits = &self.data[start..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(Error::InvalidLength(start));
        }
        let len: usize = std::str::from_utf8(digits)
            .expect("digits are ascii")
            .parse()
            .map_err(|_| Error::InvalidLength(start))?;

        let data_start = colon + 1;
        let data_end = data_start.checked_add(len).ok_or(Error::InvalidLength(start))?;
        if data_end > self.data.len() {
            return Err(Error::Truncated(self.data.len()));
        }

        self.pos = data_end;
        Ok(self.data[data_start..data_end].to_vec())
    }

    // l<elements>e
    fn decode_list(&mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(out);
            }
            out.push(self.decode_value()?);
        }
    }

    // d<key-value pairs>e, keys are byte strings in their original order.
    fn decode_dict(&mut self) -> Result<Dict> {
        let mut entries = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Dict::order_preserving(entries));
            }
            let key_offset = self.pos;
            let key = match self.decode_value()? {
                Value::Bytes(k) => k,
                _ => return Err(Error::NonStringKey(key_offset)),
            };
            let value = self.decode_value()?;
            entries.push((key, value));
        }
    }

    fn find(&self, byte: u8) -> Option<usize> {
        self.data[self.pos..]
            .iter()
            .position(|b| *b == byte)
            .map(|i| self.pos + i)
    }
}
