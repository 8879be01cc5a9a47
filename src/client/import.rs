// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Staging local data as CARv2 archives.
//!
//! The root of a DAG is only known once the last block is written, but a CAR
//! header comes first. Archives are therefore created with a placeholder root
//! of the same encoded length as any real root, and the header is patched in
//! place after the archive is finalized.

use super::ClientApi;
use crate::commp::{CommPRet, CommPWriter, calc_comm_p};
use crate::db::Cancellable;
use crate::db::car::{CarReadOnly, CarV2ReadWrite, replace_car_v2_roots};
use crate::error::{MarketError, Result};
use crate::imports::{Import, ImportId, ImportManager, LABEL_FILE_NAME, LABEL_SOURCE};
use crate::ipld::write_dag_car_v1;
use crate::unixfs::{BuilderOptions, BuiltNode, DagBuilder};
use crate::utils::cid::InlineCidBuilder;
use cid::Cid;
use fvm_ipld_encoding::IPLD_RAW;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRes {
    pub root: Cid,
    pub import_id: ImportId,
}

/// Root declared by an archive while its DAG is being built.
///
/// It is hashed with the same function as real roots and its content is one
/// byte past the inline limit, so it can never be an identity CID and always
/// encodes to the same length as the root that replaces it.
pub fn placeholder_root(builder: &InlineCidBuilder) -> Cid {
    builder.cid(IPLD_RAW, &vec![0; builder.hashed_threshold()])
}

type CarBuilder<'a> = DagBuilder<'a, Cancellable<'a, CarV2ReadWrite>>;

/// Builds a DAG with `build` into a new archive at `path` and points the
/// archive header at the resulting root. Every block write fails with
/// [`MarketError::Cancelled`] once `cancel` fires.
fn build_car(
    path: &Path,
    opts: BuilderOptions,
    cancel: &CancellationToken,
    build: impl FnOnce(&CarBuilder<'_>) -> anyhow::Result<BuiltNode>,
) -> Result<Cid> {
    let car = CarV2ReadWrite::create(path, nunny::vec![placeholder_root(&opts.cid_builder)])?;
    let store = Cancellable::new(&car, cancel);
    let root = build(&DagBuilder::new(&store, opts))
        .map_err(MarketError::from_anyhow)?
        .cid;
    car.finalize()?;
    replace_car_v2_roots(path, nunny::vec![root])?;
    Ok(root)
}

/// Creates an import backed by a managed archive. A failed import is removed
/// again, archive included.
fn import_into_car(
    imports: &ImportManager,
    opts: BuilderOptions,
    file_name: Option<String>,
    cancel: &CancellationToken,
    build: impl FnOnce(&CarBuilder<'_>) -> anyhow::Result<BuiltNode>,
) -> Result<ImportRes> {
    let import_id = imports.create_import();
    let result = (|| -> Result<Cid> {
        let path = imports.allocate_car(import_id)?;
        let root = build_car(&path, opts, cancel, build)?;
        if cancel.is_cancelled() {
            return Err(MarketError::Cancelled);
        }
        imports.set_root(import_id, root)?;
        imports.add_label(import_id, LABEL_SOURCE, "import")?;
        if let Some(name) = file_name {
            imports.add_label(import_id, LABEL_FILE_NAME, name)?;
        }
        Ok(root)
    })();
    match result {
        Ok(root) => {
            info!(%import_id, %root, "imported");
            Ok(ImportRes { root, import_id })
        }
        Err(e) => {
            if let Err(cleanup) = imports.remove(import_id) {
                warn!(%import_id, "failed to clean up import: {cleanup}");
            }
            Err(e)
        }
    }
}

/// Registers a caller supplied CARv1 or CARv2 holding exactly one root.
fn import_existing_car(
    imports: &ImportManager,
    path: PathBuf,
    cancel: &CancellationToken,
) -> Result<ImportRes> {
    if cancel.is_cancelled() {
        return Err(MarketError::Cancelled);
    }
    let car = CarReadOnly::open(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            MarketError::Format(format!("{}: {e}", path.display()))
        }
        _ => e.into(),
    })?;
    let root = match car.roots() {
        [root] => *root,
        roots => {
            return Err(MarketError::Format(format!(
                "car file can have one and only one root; has {}",
                roots.len()
            )));
        }
    };
    drop(car);
    if cancel.is_cancelled() {
        return Err(MarketError::Cancelled);
    }

    let import_id = imports.create_import();
    let registered = imports
        .set_external_car(import_id, &path)
        .and_then(|()| imports.set_root(import_id, root))
        .and_then(|()| imports.add_label(import_id, LABEL_SOURCE, "car"))
        .and_then(|()| imports.add_label(import_id, LABEL_FILE_NAME, path.display().to_string()));
    if let Err(e) = registered {
        if let Err(cleanup) = imports.remove(import_id) {
            warn!(%import_id, "failed to clean up import: {cleanup}");
        }
        return Err(e);
    }
    info!(%import_id, %root, path = %path.display(), "registered CAR");
    Ok(ImportRes { root, import_id })
}

/// Runs blocking archive work off the async executor.
pub(super) async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MarketError::Other(anyhow::anyhow!("blocking task failed: {e}")))?
}

impl ClientApi {
    /// Imports a file or a directory tree into a new managed archive. A
    /// cancelled import is removed again before this returns.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn import_from_path(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<ImportRes> {
        let path = path.as_ref().to_path_buf();
        let imports = self.imports.clone();
        let opts = self.config.import.builder_options();
        let cancel = cancel.clone();
        blocking(move || {
            let name = path.display().to_string();
            import_into_car(&imports, opts, Some(name), &cancel, |builder| {
                builder.add_path(&path)
            })
        })
        .await
    }

    /// Imports everything `reader` yields as a single file, in one pass.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn import_from_stream(
        &self,
        reader: impl Read + Send + 'static,
        cancel: &CancellationToken,
    ) -> Result<ImportRes> {
        let imports = self.imports.clone();
        let opts = self.config.import.builder_options();
        let cancel = cancel.clone();
        blocking(move || {
            import_into_car(&imports, opts, None, &cancel, |builder| {
                builder.add_file(reader, true)
            })
        })
        .await
    }

    /// Registers an existing CAR file. The file stays owned by the caller and
    /// survives removal of the import.
    pub async fn import_car(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<ImportRes> {
        let path = path.as_ref().to_path_buf();
        let imports = self.imports.clone();
        let cancel = cancel.clone();
        blocking(move || import_existing_car(&imports, path, &cancel)).await
    }

    pub fn list_imports(&self) -> Vec<Import> {
        self.imports.list()
    }

    pub fn remove_import(&self, id: ImportId) -> Result<()> {
        self.imports.remove(id)
    }

    pub fn has_local(&self, root: &Cid) -> bool {
        !self.imports.find_by_root(root).is_empty()
    }

    /// Chunks `input` into a DAG and writes it to `output` as a CARv1. The
    /// output is removed again when this fails.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn gen_car(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<Cid> {
        let (input, output) = (input.as_ref().to_path_buf(), output.as_ref().to_path_buf());
        let staging_dir = self.imports.imports_dir().to_path_buf();
        let opts = self.config.import.builder_options();
        let cancel = cancel.clone();
        blocking(move || {
            let staging = tempfile::Builder::new()
                .prefix("gen-car-")
                .suffix(".car")
                .tempfile_in(staging_dir)?;
            let root = build_car(staging.path(), opts, &cancel, |builder| builder.add_path(&input))?;
            let car = CarReadOnly::open(staging.path())?;
            let written = File::create(&output)
                .map_err(MarketError::from)
                .and_then(|file| {
                    write_dag_car_v1(&Cancellable::new(&car, &cancel), &root, BufWriter::new(file))
                });
            let written = match written {
                Ok(written) => written,
                Err(e) => {
                    if let Err(cleanup) = std::fs::remove_file(&output) {
                        if cleanup.kind() != std::io::ErrorKind::NotFound {
                            warn!(output = %output.display(), "failed to remove partial CAR: {cleanup}");
                        }
                    }
                    return Err(e);
                }
            };
            info!(%root, written, output = %output.display(), "generated CAR");
            Ok(root)
        })
        .await
    }

    /// Piece commitment of a file. For a CARv2 this is the commitment of its
    /// inner CARv1, which is what providers store.
    pub async fn calc_comm_p(
        &self,
        input: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<CommPRet> {
        let input = input.as_ref().to_path_buf();
        let commp = blocking(move || match CarReadOnly::open(&input) {
            Ok(car) if car.version() == 2 => {
                let mut writer = CommPWriter::default();
                car.write_v1_payload(&mut writer)?;
                writer.finish()
            }
            _ => calc_comm_p(BufReader::new(File::open(&input)?)),
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MarketError::Cancelled),
            commp = commp => commp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::harness;
    use crate::db::MemoryDB;
    use crate::unixfs::write_file;
    use crate::utils::cid::is_inline;
    use crate::utils::multihash::prelude::*;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    fn content(len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect()
    }

    fn read_back(path: &Path, root: &Cid) -> Vec<u8> {
        let car = CarReadOnly::open(path).unwrap();
        let mut out = vec![];
        write_file(&car, root, &mut out).unwrap();
        out
    }

    #[quickcheck]
    fn placeholder_matches_any_hashed_root(inline_limit: u8, data: Vec<u8>) {
        let builder = InlineCidBuilder::new(MultihashCode::Blake2b256, inline_limit.into());
        let placeholder = placeholder_root(&builder);
        assert!(!is_inline(&placeholder));
        let root = Cid::new_v1(crate::unixfs::DAG_PB, MultihashCode::Blake2b256.digest(&data));
        assert_eq!(placeholder.encoded_len(), root.encoded_len());
    }

    #[tokio::test]
    async fn ten_mebibytes_import_deterministically() {
        let h = crate::client::tests::harness_with(|c| c.import.chunk_size = 256 * 1024, false);
        let data = content(10 * 1024 * 1024);
        let file = h.dir.path().join("input.bin");
        std::fs::write(&file, &data).unwrap();

        let first = h.client.import_from_path(&file, &CancellationToken::new()).await.unwrap();
        let second = h.client.import_from_path(&file, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.root, second.root);
        assert_ne!(first.import_id, second.import_id);

        let import = h.client.imports().info(first.import_id).unwrap();
        let car_path = import.car_path.unwrap();
        let car = CarReadOnly::open(&car_path).unwrap();
        assert_eq!(car.version(), 2);
        assert_eq!(car.roots(), &[first.root]);
        drop(car);
        assert_eq!(read_back(&car_path, &first.root), data);
        assert_eq!(import.labels[LABEL_SOURCE], "import");
        assert_eq!(import.labels[LABEL_FILE_NAME], file.display().to_string());
        assert!(h.client.has_local(&first.root));
    }

    #[tokio::test]
    async fn stream_import_matches_path_import() {
        let h = harness();
        let data = content(300_000);
        let file = h.dir.path().join("input.bin");
        std::fs::write(&file, &data).unwrap();

        let from_path = h.client.import_from_path(&file, &CancellationToken::new()).await.unwrap();
        let from_stream = h
            .client
            .import_from_stream(std::io::Cursor::new(data.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(from_path.root, from_stream.root);
        let import = h.client.imports().info(from_stream.import_id).unwrap();
        assert_eq!(import.label(LABEL_FILE_NAME), None);
        assert_eq!(read_back(&import.car_path.unwrap(), &from_stream.root), data);
    }

    #[tokio::test]
    async fn tiny_and_empty_inputs_get_hashed_roots() {
        let h = harness();
        for data in [vec![], b"hi".to_vec()] {
            let res = h
                .client
                .import_from_stream(std::io::Cursor::new(data.clone()), &CancellationToken::new())
                .await
                .unwrap();
            assert!(!is_inline(&res.root));
            let path = h.client.imports().info(res.import_id).unwrap().car_path.unwrap();
            assert_eq!(read_back(&path, &res.root), data);
        }
    }

    #[tokio::test]
    async fn failed_import_leaves_nothing_behind() {
        let h = harness();
        let err = h
            .client
            .import_from_path(h.dir.path().join("missing"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Io(_)), "{err}");
        assert!(h.client.list_imports().is_empty());
        let leftovers = std::fs::read_dir(h.client.imports().imports_dir())
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    /// Fires `cancel` once `after` bytes have been read.
    struct CancelAfter {
        data: std::io::Cursor<Vec<u8>>,
        after: u64,
        cancel: CancellationToken,
    }

    impl Read for CancelAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.data.position() >= self.after {
                self.cancel.cancel();
            }
            self.data.read(buf)
        }
    }

    fn assert_no_imports(h: &crate::client::tests::Harness) {
        assert!(h.client.list_imports().is_empty());
        let leftovers = std::fs::read_dir(h.client.imports().imports_dir())
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn import_cancelled_midway_leaves_nothing_behind() {
        let h = crate::client::tests::harness_with(|c| c.import.chunk_size = 256 * 1024, false);
        let cancel = CancellationToken::new();
        let reader = CancelAfter {
            data: std::io::Cursor::new(content(8 * 1024 * 1024)),
            after: 2 * 1024 * 1024,
            cancel: cancel.clone(),
        };
        let err = h.client.import_from_stream(reader, &cancel).await.unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        assert_no_imports(&h);
    }

    #[tokio::test]
    async fn cancelled_token_stops_every_import_kind() {
        let h = harness();
        let input = h.dir.path().join("input.bin");
        std::fs::write(&input, content(50_000)).unwrap();
        let output = h.dir.path().join("out.car");
        h.client
            .gen_car(&input, &output, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h.client.import_from_path(&input, &cancel).await.unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        let err = h.client.import_car(&output, &cancel).await.unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        let err = h.client.calc_comm_p(&input, &cancel).await.unwrap_err();
        assert!(err.is_cancelled(), "{err}");

        let second = h.dir.path().join("second.car");
        let err = h.client.gen_car(&input, &second, &cancel).await.unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        assert!(!second.exists());
        assert_no_imports(&h);
    }

    #[tokio::test]
    async fn removing_twice_is_not_found_and_spares_other_imports() {
        let h = harness();
        let a = h
            .client
            .import_from_stream(std::io::Cursor::new(content(5000)), &CancellationToken::new())
            .await
            .unwrap();
        let b = h
            .client
            .import_from_stream(std::io::Cursor::new(content(5000)), &CancellationToken::new())
            .await
            .unwrap();
        let b_path = h.client.imports().info(b.import_id).unwrap().car_path.unwrap();

        h.client.remove_import(a.import_id).unwrap();
        let err = h.client.remove_import(a.import_id).unwrap_err();
        assert!(matches!(err, MarketError::NotFound(_)), "{err}");
        assert!(b_path.exists());
        assert!(h.client.has_local(&b.root));
    }

    #[tokio::test]
    async fn external_car_is_validated_and_kept() {
        let h = harness();
        let data = content(9000);
        let input = h.dir.path().join("input.bin");
        std::fs::write(&input, &data).unwrap();
        let output = h.dir.path().join("out.car");
        let root = h.client.gen_car(&input, &output, &CancellationToken::new()).await.unwrap();

        let res = h.client.import_car(&output, &CancellationToken::new()).await.unwrap();
        assert_eq!(res.root, root);
        assert_eq!(
            h.client.imports().label(res.import_id, LABEL_SOURCE).unwrap().as_deref(),
            Some("car")
        );
        h.client.remove_import(res.import_id).unwrap();
        assert_eq!(read_back(&output, &root), data);

        let not_a_car = h.dir.path().join("junk.car");
        std::fs::write(&not_a_car, b"\x05hello").unwrap();
        let err = h.client.import_car(&not_a_car, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MarketError::Format(_)), "{err}");
        assert!(h.client.list_imports().is_empty());
    }

    #[tokio::test]
    async fn car_with_two_roots_is_refused() {
        let h = harness();
        let staging = MemoryDB::default();
        let opts = BuilderOptions::default();
        let a = DagBuilder::new(&staging, opts).add_file(&b"a"[..], true).unwrap();
        let b = DagBuilder::new(&staging, opts).add_file(&b"b"[..], true).unwrap();
        let path = h.dir.path().join("two.car");
        let car = CarV2ReadWrite::create(&path, nunny::vec![a.cid, b.cid]).unwrap();
        crate::ipld::walk_dag(&staging, &a.cid, |block| {
            fvm_ipld_blockstore::Blockstore::put_keyed(&car, &block.cid, &block.data)?;
            Ok(())
        })
        .unwrap();
        car.finalize().unwrap();

        let err = h.client.import_car(&path, &CancellationToken::new()).await.unwrap_err();
        assert!(
            matches!(&err, MarketError::Format(msg) if msg.contains("has 2")),
            "{err}"
        );
    }

    #[tokio::test]
    async fn comm_p_of_carv2_covers_its_inner_carv1() {
        let h = harness();
        let input = h.dir.path().join("input.bin");
        std::fs::write(&input, content(20_000)).unwrap();
        let res = h.client.import_from_path(&input, &CancellationToken::new()).await.unwrap();
        let v2 = h.client.imports().info(res.import_id).unwrap().car_path.unwrap();

        let mut inner = vec![];
        CarReadOnly::open(&v2)
            .unwrap()
            .write_v1_payload(&mut inner)
            .unwrap();
        let expected = calc_comm_p(inner.as_slice()).unwrap();
        assert_eq!(h.client.calc_comm_p(&v2, &CancellationToken::new()).await.unwrap(), expected);
        assert_eq!(
            expected.size,
            crate::commp::unpadded_piece_size(inner.len() as u64)
        );
    }
}
