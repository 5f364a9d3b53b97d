//! Minimal read-only walker for flattened device tree blobs.
//!
//! Only what locating an image entry needs: header validation, child lookup and
//! property access. Every offset read from the blob is bounds checked; anything that
//! does not add up is reported as [`FormatFault::Structure`].

use crate::{Error, FormatFault};

pub const FDT_MAGIC: u32 = 0xd00d_feed;

/// Bytes needed to learn the total size of a blob.
pub const PROBE_LEN: usize = 8;

const HEADER_LEN: usize = 40;
/// First version carrying `size_dt_struct`.
const MIN_VERSION: u32 = 17;

const TOKEN_BEGIN_NODE: u32 = 1;
const TOKEN_END_NODE: u32 = 2;
const TOKEN_PROP: u32 = 3;
const TOKEN_NOP: u32 = 4;
const TOKEN_END: u32 = 9;

const fn malformed() -> Error {
    Error::Format(FormatFault::Structure)
}

fn be32(bytes: &[u8], offset: usize) -> Result<u32, Error> {
    let word = offset
        .checked_add(4)
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(malformed)?;
    Ok(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

fn cstr(bytes: &[u8], offset: usize) -> Result<&str, Error> {
    let tail = bytes.get(offset..).ok_or_else(malformed)?;
    let len = tail.iter().position(|&b| b == 0).ok_or_else(malformed)?;
    core::str::from_utf8(&tail[..len]).map_err(|_| malformed())
}

const fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

/// Check the magic and return the size the blob declares for itself.
pub fn total_size(probe: &[u8]) -> Result<usize, Error> {
    if probe.len() < PROBE_LEN || be32(probe, 0)? != FDT_MAGIC {
        return Err(Error::Format(FormatFault::Magic));
    }
    Ok(be32(probe, 4)? as usize)
}

#[derive(Clone, Copy)]
enum Token<'a> {
    BeginNode(&'a str),
    EndNode,
    Prop(Property<'a>),
    End,
}

/// A property value, with its offset from the start of the blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Property<'a> {
    pub name: &'a str,
    pub value: &'a [u8],
    pub offset: usize,
}

impl<'a> Property<'a> {
    pub fn as_u32(&self) -> Result<u32, Error> {
        if self.value.len() != 4 {
            return Err(malformed());
        }
        be32(self.value, 0)
    }

    /// A one- or two-cell address.
    pub fn as_address(&self) -> Result<u64, Error> {
        match self.value.len() {
            4 => Ok(be32(self.value, 0)? as u64),
            8 => Ok(((be32(self.value, 0)? as u64) << 32) | be32(self.value, 4)? as u64),
            _ => Err(malformed()),
        }
    }

    pub fn as_str(&self) -> Result<&'a str, Error> {
        cstr(self.value, 0)
    }

    /// Entries of a NUL separated string list.
    pub fn strings(&self) -> impl Iterator<Item = Result<&'a str, Error>> + 'a {
        let value = self.value;
        let body = value.strip_suffix(&[0u8]).unwrap_or(value);
        body.split(|&b| b == 0)
            .filter(move |_| !value.is_empty())
            .map(|s| core::str::from_utf8(s).map_err(|_| malformed()))
    }
}

#[derive(Clone, Copy)]
pub struct Fdt<'a> {
    structs: &'a [u8],
    strings: &'a [u8],
    struct_offset: usize,
}

impl<'a> Fdt<'a> {
    pub fn new(blob: &'a [u8]) -> Result<Self, Error> {
        let total = total_size(blob)?;
        if blob.len() < total || total < HEADER_LEN {
            return Err(malformed());
        }
        if be32(blob, 20)? < MIN_VERSION {
            return Err(malformed());
        }

        let section = move |offset_at: usize, size_at: usize| -> Result<(usize, &'a [u8]), Error> {
            let start = be32(blob, offset_at)? as usize;
            let len = be32(blob, size_at)? as usize;
            let end = start.checked_add(len).ok_or_else(malformed)?;
            let bytes = blob[..total].get(start..end).ok_or_else(malformed)?;
            Ok((start, bytes))
        };
        let (struct_offset, structs) = section(8, 36)?;
        let (_, strings) = section(12, 32)?;

        Ok(Self {
            structs,
            strings,
            struct_offset,
        })
    }

    pub fn root(&self) -> Result<Node<'a>, Error> {
        match self.token(0)? {
            (Token::BeginNode(name), body) => Ok(Node {
                fdt: *self,
                name,
                body,
            }),
            _ => Err(malformed()),
        }
    }

    /// Decode the token at `pos`, skipping NOPs, returning it and the position after it.
    fn token(&self, mut pos: usize) -> Result<(Token<'a>, usize), Error> {
        loop {
            let tag = be32(self.structs, pos)?;
            pos += 4;
            if tag == TOKEN_NOP {
                continue;
            }

            return match tag {
                TOKEN_BEGIN_NODE => {
                    let name = cstr(self.structs, pos)?;
                    Ok((Token::BeginNode(name), align4(pos + name.len() + 1)))
                }
                TOKEN_END_NODE => Ok((Token::EndNode, pos)),
                TOKEN_PROP => {
                    let len = be32(self.structs, pos)? as usize;
                    let name = cstr(self.strings, be32(self.structs, pos + 4)? as usize)?;
                    let start = pos + 8;
                    let value = self
                        .structs
                        .get(start..start.checked_add(len).ok_or_else(malformed)?)
                        .ok_or_else(malformed)?;
                    let property = Property {
                        name,
                        value,
                        offset: self.struct_offset + start,
                    };
                    Ok((Token::Prop(property), align4(start + len)))
                }
                TOKEN_END => Ok((Token::End, pos)),
                _ => Err(malformed()),
            };
        }
    }

    /// Position just past the end of the node whose body starts at `pos`.
    fn skip_node(&self, mut pos: usize) -> Result<usize, Error> {
        let mut depth = 1usize;
        while depth > 0 {
            let (token, next) = self.token(pos)?;
            match token {
                Token::BeginNode(_) => depth += 1,
                Token::EndNode => depth -= 1,
                Token::Prop(_) => {}
                Token::End => return Err(malformed()),
            }
            pos = next;
        }
        Ok(pos)
    }
}

#[derive(Clone, Copy)]
pub struct Node<'a> {
    fdt: Fdt<'a>,
    name: &'a str,
    /// Position of the first token inside this node.
    body: usize,
}

impl<'a> Node<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn property(&self, name: &str) -> Result<Option<Property<'a>>, Error> {
        let mut pos = self.body;
        loop {
            let (token, next) = self.fdt.token(pos)?;
            match token {
                Token::Prop(property) if property.name == name => return Ok(Some(property)),
                Token::Prop(_) => pos = next,
                // Properties always precede subnodes.
                Token::BeginNode(_) | Token::EndNode => return Ok(None),
                Token::End => return Err(malformed()),
            }
        }
    }

    pub fn children(&self) -> Children<'a> {
        Children {
            fdt: self.fdt,
            pos: Some(self.body),
        }
    }

    pub fn child(&self, name: &str) -> Result<Option<Node<'a>>, Error> {
        for child in self.children() {
            let child = child?;
            if child.name == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }
}

pub struct Children<'a> {
    fdt: Fdt<'a>,
    pos: Option<usize>,
}

impl<'a> Children<'a> {
    fn advance(&mut self, mut pos: usize) -> Result<Option<Node<'a>>, Error> {
        loop {
            let (token, next) = self.fdt.token(pos)?;
            match token {
                Token::Prop(_) => pos = next,
                Token::BeginNode(name) => {
                    self.pos = Some(self.fdt.skip_node(next)?);
                    return Ok(Some(Node {
                        fdt: self.fdt,
                        name,
                        body: next,
                    }));
                }
                Token::EndNode => return Ok(None),
                Token::End => return Err(malformed()),
            }
        }
    }
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<Node<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pos.take()?;
        self.advance(pos).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FdtBuilder;

    fn sample() -> std::vec::Vec<u8> {
        FdtBuilder::new()
            .begin("")
            .prop_str("description", "sample")
            .begin("images")
            .begin("firmware-1")
            .prop_u32("load", 0x8000_0000)
            .prop("data", &[1, 2, 3])
            .end()
            .begin("firmware-2")
            .prop("load", &[0, 0, 0, 1, 0, 0, 0, 2])
            .end()
            .end()
            .begin("configurations")
            .prop("list", b"one\0two\0")
            .end()
            .end()
            .finish(0)
    }

    #[test]
    fn walk() {
        let blob = sample();
        let fdt = Fdt::new(&blob).unwrap();
        let root = fdt.root().unwrap();

        let description = root.property("description").unwrap().unwrap();
        assert_eq!(description.as_str(), Ok("sample"));

        let images = root.child("images").unwrap().unwrap();
        let names: std::vec::Vec<_> = images.children().map(|n| n.unwrap().name()).collect();
        assert_eq!(names, ["firmware-1", "firmware-2"]);

        let first = images.child("firmware-1").unwrap().unwrap();
        assert_eq!(first.property("load").unwrap().unwrap().as_address(), Ok(0x8000_0000));
        let data = first.property("data").unwrap().unwrap();
        assert_eq!(&blob[data.offset..data.offset + 3], &[1, 2, 3]);

        let second = images.child("firmware-2").unwrap().unwrap();
        assert_eq!(
            second.property("load").unwrap().unwrap().as_address(),
            Ok(0x1_0000_0002)
        );
        assert!(second.property("data").unwrap().is_none());
        assert!(images.child("firmware-3").unwrap().is_none());

        let configs = root.child("configurations").unwrap().unwrap();
        let list = configs.property("list").unwrap().unwrap();
        let entries: std::vec::Vec<_> = list.strings().map(Result::unwrap).collect();
        assert_eq!(entries, ["one", "two"]);
    }

    #[test]
    fn bad_magic() {
        let mut blob = sample();
        blob[0] = 0;

        assert!(matches!(
            Fdt::new(&blob),
            Err(Error::Format(FormatFault::Magic))
        ));
        assert_eq!(total_size(&[0xd0, 0x0d]), Err(Error::Format(FormatFault::Magic)));
    }

    #[test]
    fn truncated_blob() {
        let blob = sample();

        assert!(matches!(
            Fdt::new(&blob[..blob.len() - 8]),
            Err(Error::Format(FormatFault::Structure))
        ));
    }

    #[test]
    fn unterminated_tree() {
        // Root node never closed.
        let blob = FdtBuilder::new().begin("").begin("images").end().finish(0);
        let fdt = Fdt::new(&blob).unwrap();
        let root = fdt.root().unwrap();

        assert!(matches!(
            root.child("missing"),
            Err(Error::Format(FormatFault::Structure))
        ));
    }
}
