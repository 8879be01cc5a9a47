// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::{Bytes, BytesMut};
use fvm_ipld_encoding::{from_slice, to_vec};
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};
use unsigned_varint::codec::UviBytes;

/// Upper bound on a single proposal or response frame.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Varint framed `dag-cbor` messages. Encodes `Out` and decodes `In`, so the
/// client side of the deal protocol is `DagCborCodec<Proposal, SignedResponse>`
/// and a provider speaks the mirror image.
pub struct DagCborCodec<Out, In> {
    frames: UviBytes,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<Out, In> Default for DagCborCodec<Out, In> {
    fn default() -> Self {
        let mut frames = UviBytes::default();
        frames.set_max_len(MAX_FRAME_LEN);
        Self {
            frames,
            _marker: PhantomData,
        }
    }
}

impl<Out: Serialize, In> Encoder<Out> for DagCborCodec<Out, In> {
    type Error = io::Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = to_vec(&item).map_err(invalid_data)?;
        self.frames.encode(Bytes::from(body), dst)
    }
}

impl<Out, In: DeserializeOwned> Decoder for DagCborCodec<Out, In> {
    type Item = In;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => from_slice(&frame).map(Some).map_err(invalid_data),
            None => Ok(None),
        }
    }
}

fn invalid_data(e: fvm_ipld_encoding::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = DagCborCodec::<Vec<String>, Vec<String>>::default();
        let msg = vec!["proposal".to_owned(), "response".to_owned()];
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(msg));
        assert!(partial.is_empty());
    }

    #[test]
    fn garbage_is_invalid_data() {
        let mut codec = DagCborCodec::<u64, String>::default();
        let mut buf = BytesMut::new();
        codec.encode(7, &mut buf).unwrap();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frames_are_refused() {
        let mut codec = DagCborCodec::<Vec<u8>, Vec<u8>>::default();
        let mut buf = BytesMut::new();
        assert!(codec.encode(vec![0; MAX_FRAME_LEN + 1], &mut buf).is_err());
    }
}
