// SPDX-License-Identifier: Apache-2.0

//! Service image pipeline: unpack and validate a downloaded archive, then
//! chunk its files for delivery over the secure CM channel.

pub mod digest;

mod chunker;
mod unpacker;

pub use chunker::{chunk_files, ContentInfo, ImageContentPart, ImageFileInfo, CHUNK_SIZE};
pub use unpacker::ImageUnpacker;
