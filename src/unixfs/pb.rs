// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! `dag-pb` nodes and the UnixFS `Data` message they carry.
//!
//! ```protobuf
//! message PBLink { optional bytes Hash = 1; optional string Name = 2; optional uint64 Tsize = 3; }
//! message PBNode { repeated PBLink Links = 2; optional bytes Data = 1; }
//! message Data {
//!     enum DataType { Raw = 0; Directory = 1; File = 2; Metadata = 3; Symlink = 4; HAMTShard = 5; }
//!     required DataType Type = 1; optional bytes Data = 2; optional uint64 filesize = 3;
//!     repeated uint64 blocksizes = 4;
//! }
//! ```
//!
//! Links are written before data, as required by the `dag-pb` spec:
//! <https://ipld.io/specs/codecs/dag-pb/spec/#canonical-form>

use cid::Cid;
use quick_protobuf::sizeofs::{sizeof_len, sizeof_varint};
use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Writer, WriterBackend};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PbLink {
    pub hash: Option<Vec<u8>>,
    pub name: Option<String>,
    pub tsize: Option<u64>,
}

impl PbLink {
    pub fn new(cid: &Cid, name: impl Into<String>, tsize: u64) -> Self {
        Self {
            hash: Some(cid.to_bytes()),
            name: Some(name.into()),
            tsize: Some(tsize),
        }
    }

    pub fn cid(&self) -> anyhow::Result<Cid> {
        let hash = self
            .hash
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("dag-pb link without a hash"))?;
        Ok(Cid::try_from(hash)?)
    }
}

impl<'a> MessageRead<'a> for PbLink {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.hash = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(18) => msg.name = Some(r.read_string(bytes)?.to_owned()),
                Ok(24) => msg.tsize = Some(r.read_uint64(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for PbLink {
    fn get_size(&self) -> usize {
        self.hash.as_ref().map_or(0, |m| 1 + sizeof_len(m.len()))
            + self.name.as_ref().map_or(0, |m| 1 + sizeof_len(m.len()))
            + self.tsize.map_or(0, |m| 1 + sizeof_varint(m))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        if let Some(s) = &self.hash {
            w.write_with_tag(10, |w| w.write_bytes(s))?;
        }
        if let Some(s) = &self.name {
            w.write_with_tag(18, |w| w.write_string(s))?;
        }
        if let Some(s) = self.tsize {
            w.write_with_tag(24, |w| w.write_uint64(s))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PbNode {
    pub links: Vec<PbLink>,
    pub data: Option<Vec<u8>>,
}

impl PbNode {
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        decode(bytes)
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        encode(self)
    }
}

impl<'a> MessageRead<'a> for PbNode {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(18) => msg.links.push(r.read_message::<PbLink>(bytes)?),
                Ok(10) => msg.data = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for PbNode {
    fn get_size(&self) -> usize {
        self.links
            .iter()
            .map(|s| 1 + sizeof_len(s.get_size()))
            .sum::<usize>()
            + self.data.as_ref().map_or(0, |m| 1 + sizeof_len(m.len()))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        for s in &self.links {
            w.write_with_tag(18, |w| w.write_message(s))?;
        }
        if let Some(s) = &self.data {
            w.write_with_tag(10, |w| w.write_bytes(s))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(i32)]
pub enum DataType {
    #[default]
    Raw = 0,
    Directory = 1,
    File = 2,
    Metadata = 3,
    Symlink = 4,
    HamtShard = 5,
}

/// The UnixFS payload of a `dag-pb` node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnixFsData {
    pub data_type: DataType,
    pub data: Option<Vec<u8>>,
    pub filesize: Option<u64>,
    pub blocksizes: Vec<u64>,
}

impl UnixFsData {
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        decode(bytes)
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        encode(self)
    }
}

impl<'a> MessageRead<'a> for UnixFsData {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => {
                    let raw = r.read_int32(bytes)?;
                    msg.data_type = DataType::from_repr(raw).ok_or(
                        quick_protobuf::Error::Message(format!("unknown UnixFS type {raw}")),
                    )?;
                }
                Ok(18) => msg.data = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(24) => msg.filesize = Some(r.read_uint64(bytes)?),
                Ok(32) => msg.blocksizes.push(r.read_uint64(bytes)?),
                Ok(34) => msg
                    .blocksizes
                    .extend(r.read_packed(bytes, |r, bytes| r.read_uint64(bytes))?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for UnixFsData {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.data_type as i32 as u64)
            + self.data.as_ref().map_or(0, |m| 1 + sizeof_len(m.len()))
            + self.filesize.map_or(0, |m| 1 + sizeof_varint(m))
            + self
                .blocksizes
                .iter()
                .map(|s| 1 + sizeof_varint(*s))
                .sum::<usize>()
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        w.write_with_tag(8, |w| w.write_int32(self.data_type as i32))?;
        if let Some(s) = &self.data {
            w.write_with_tag(18, |w| w.write_bytes(s))?;
        }
        if let Some(s) = self.filesize {
            w.write_with_tag(24, |w| w.write_uint64(s))?;
        }
        for s in &self.blocksizes {
            w.write_with_tag(32, |w| w.write_uint64(*s))?;
        }
        Ok(())
    }
}

fn decode<M: for<'a> MessageRead<'a>>(bytes: &[u8]) -> anyhow::Result<M> {
    let mut reader = BytesReader::from_bytes(bytes);
    Ok(M::from_reader(&mut reader, bytes)?)
}

fn encode(msg: &impl MessageWrite) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(msg.get_size());
    msg.write_message(&mut Writer::new(&mut out))?;
    Ok(out)
}
