// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::read_only::{read_v1_header, read_v2_header};
use crate::error::{MarketError, Result};
use crate::utils::db::car_format::CarV1Header;
use cid::Cid;
use nunny::Vec as NonEmpty;
use positioned_io::WriteAt as _;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// Replaces the roots declared by the inner CARv1 header of a finalized
/// CARv2, in place.
///
/// Block offsets and the index are left untouched, so the new header must
/// serialize to exactly as many bytes as the one it replaces. If it does not
/// the file is left as is and [`MarketError::Format`] is returned.
///
/// The caller must hold the only handle to `path`.
#[tracing::instrument(level = "debug", skip(roots))]
pub fn replace_car_v2_roots(path: &Path, roots: NonEmpty<Cid>) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;
    let v2_header = read_v2_header(&file)?
        .ok_or_else(|| MarketError::format("roots can only be replaced in a CARv2"))?;

    let current = {
        let reader = positioned_io::Cursor::new_pos(&file, v2_header.data_offset);
        read_v1_header(BufReader::new(reader), v2_header.data_size).map_err(MarketError::format)?
    };
    let current_len = current.to_frame()?.len();

    let replacement = CarV1Header {
        roots,
        version: current.version,
    }
    .to_frame()?;
    if replacement.len() != current_len {
        return Err(MarketError::Format(format!(
            "new CAR header is {} bytes, the existing one is {current_len}",
            replacement.len()
        )));
    }

    file.write_all_at(v2_header.data_offset, &replacement)?;
    file.sync_all()?;
    debug!(header_len = current_len, "replaced CAR roots");
    Ok(())
}
