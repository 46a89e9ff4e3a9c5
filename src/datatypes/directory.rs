use crate::codec::{CodecError, Reader, Writer, WireCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttribute {
    pub kind: i32,
    pub value: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub filename: String,
    pub size: i64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

impl FileEntry {
    pub fn encode<C: WireCode>(&self, w: &mut Writer<C>) {
        w.write_u8(1); // legacy per-entry code, always 1 on the wire
        w.write_string(&self.filename);
        w.write_i64(self.size);
        w.write_string(&self.extension);
        w.write_i32(self.attributes.len() as i32);
        for attr in &self.attributes {
            w.write_i32(attr.kind);
            w.write_i32(attr.value);
        }
    }

    pub fn decode<C: WireCode>(r: &mut Reader<C>) -> Result<Self, CodecError> {
        let _legacy_code = r.read_u8()?;
        let filename = r.read_string()?;
        let size = r.read_i64()?;
        let extension = r.read_string()?;
        let attr_count = r.read_i32()?.max(0) as usize;
        let mut attributes = Vec::with_capacity(attr_count);
        for _ in 0..attr_count {
            let kind = r.read_i32()?;
            let value = r.read_i32()?;
            attributes.push(FileAttribute { kind, value });
        }
        Ok(FileEntry {
            filename,
            size,
            extension,
            attributes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub name: String,
    pub files: Vec<FileEntry>,
    pub locked: bool,
}

impl Directory {
    pub fn encode<C: WireCode>(&self, w: &mut Writer<C>) {
        w.write_string(&self.name);
        w.write_i32(self.files.len() as i32);
        for file in &self.files {
            file.encode(w);
        }
    }

    pub fn decode<C: WireCode>(r: &mut Reader<C>, locked: bool) -> Result<Self, CodecError> {
        let name = r.read_string()?;
        let count = r.read_i32()?.max(0) as usize;
        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            files.push(FileEntry::decode(r)?);
        }
        Ok(Directory {
            name,
            files,
            locked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PeerCode;

    #[test]
    fn directory_round_trips() {
        let dir = Directory {
            name: "Music\\Artist".into(),
            files: vec![FileEntry {
                filename: "track.flac".into(),
                size: 123_456,
                extension: "flac".into(),
                attributes: vec![FileAttribute { kind: 1, value: 320 }],
            }],
            locked: false,
        };

        let mut w = Writer::<PeerCode>::begin_frame(PeerCode::BrowseResponse);
        dir.encode(&mut w);
        let body = w.build().slice(4..);

        let mut r = Reader::<PeerCode>::new(body);
        r.expect_code(PeerCode::BrowseResponse).unwrap();
        let decoded = Directory::decode(&mut r, false).unwrap();
        assert_eq!(decoded, dir);
    }
}
