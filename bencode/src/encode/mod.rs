use crate::value::Value;

#[cfg(test)]
mod test;

// Encodes a value. Dictionaries built by hand are written with their keys in
// lexicographical order as the format requires; dictionaries that came out of
// the decoder keep their original order so the bytes round-trip exactly.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(value, &mut buf);
    buf
}

fn write_value(value: &Value, buf: &mut Vec<u8>) {
    match value {

        Value::Int(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        },

        Value::Bytes(b) => write_bytes(b, buf),

        Value::List(l) => {
            buf.push(b'l');
            for item in l {
                write_value(item, buf);
            }
            buf.push(b'e');
        },

        Value::Dict(d) => {
            buf.push(b'd');
            if d.preserves_order() {
                for (key, value) in d.iter() {
                    write_bytes(key, buf);
                    write_value(value, buf);
                }
            } else {
                let mut entries: Vec<_> = d.iter().collect();
                entries.sort_by(|(a, _), (b, _)| a.cmp(b));
                for (key, value) in entries {
                    write_bytes(key, buf);
                    write_value(value, buf);
                }
            }
            buf.push(b'e');
        },
    }
}

fn write_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}
