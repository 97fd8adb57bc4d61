use super::DnsError;
use smallvec::SmallVec;
use std::fmt;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_LABEL_LEN: usize = 63;

const POINTER_TAG: u8 = 0xC0;

/// A dotted domain name together with the number of bytes it occupied (or
/// will occupy) on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsName {
    name: String,
    encoded_len: usize,
}

impl DnsName {
    /// Validates a dotted name for encoding. A trailing dot is accepted and
    /// dropped; the empty string is the root.
    pub fn new(name: &str) -> Result<Self, DnsError> {
        let name = name.strip_suffix('.').unwrap_or(name);
        let mut encoded_len = 1;
        if !name.is_empty() {
            for label in name.split('.') {
                if label.is_empty() {
                    return Err(DnsError::EmptyLabel);
                }
                if label.len() > MAX_LABEL_LEN {
                    return Err(DnsError::LabelTooLong(label.len()));
                }
                encoded_len += label.len() + 1;
            }
        }
        if encoded_len > MAX_NAME_LEN {
            return Err(DnsError::NameTooLong);
        }
        Ok(Self {
            name: name.to_string(),
            encoded_len,
        })
    }

    /// Decodes the name starting at `offset`, following compression pointers.
    /// The reported length is what the outermost read consumed: up to and
    /// including the first pointer, or through the terminating zero.
    pub fn read(message: &[u8], offset: usize) -> Result<Self, DnsError> {
        let mut name = String::new();
        let mut position = offset;
        let mut consumed: Option<usize> = None;
        let mut visited: SmallVec<[usize; 8]> = SmallVec::new();
        loop {
            let len = *message.get(position).ok_or(DnsError::Truncated)?;
            if len & POINTER_TAG == POINTER_TAG {
                let low = *message.get(position + 1).ok_or(DnsError::Truncated)?;
                if consumed.is_none() {
                    consumed = Some(position + 2 - offset);
                }
                let target = (usize::from(len & !POINTER_TAG) << 8) | usize::from(low);
                if visited.contains(&target) {
                    return Err(DnsError::PointerLoop(target));
                }
                visited.push(target);
                position = target;
                continue;
            }
            if len & POINTER_TAG != 0 {
                return Err(DnsError::UnsupportedLabelType(len));
            }
            position += 1;
            if len == 0 {
                break;
            }
            let end = position + usize::from(len);
            let label = message.get(position..end).ok_or(DnsError::Truncated)?;
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(&String::from_utf8_lossy(label));
            if name.len() + 2 > MAX_NAME_LEN {
                return Err(DnsError::NameTooLong);
            }
            position = end;
        }
        Ok(Self {
            name,
            encoded_len: consumed.unwrap_or_else(|| position - offset),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Bytes the name occupied where it was read, which for a compressed
    /// name stops after the first pointer. For a name built with `new` this
    /// equals `wire_len`.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Bytes `encode_into` writes: the uncompressed label sequence.
    pub fn wire_len(&self) -> usize {
        self.labels().map(|label| label.len() + 1).sum::<usize>() + 1
    }

    pub fn is_root(&self) -> bool {
        self.name.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.name.split('.').filter(|label| !label.is_empty())
    }

    /// Writes the uncompressed label sequence.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for label in self.labels() {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    /// Case-insensitive comparison against a dotted name.
    pub fn eq_ignore_case(&self, other: &str) -> bool {
        self.name
            .eq_ignore_ascii_case(other.strip_suffix('.').unwrap_or(other))
    }
}

impl fmt::Display for DnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(".")
        } else {
            f.write_str(&self.name)
        }
    }
}
