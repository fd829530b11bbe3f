use super::{LoadContext, RunParser};
use crate::error::Result;
use crate::lz77::{self, LZ_TAG};
use crate::run::{AssetKind, Decoder, Run, RunKind};
use std::sync::Arc;
use tracing::{debug, trace};

/// Compressed palette header: tag 0x10, 32 decompressed bytes
const PALETTE_HEADER: [u8; 4] = [LZ_TAG, 0x20, 0x00, 0x00];

/// Claims LZ77 palettes and tile sheets among the open destinations
#[derive(Debug, Clone, Copy, Default)]
pub struct LzAssets;

impl LzAssets {
    fn looks_like(kind: AssetKind, data: &[u8], at: usize) -> bool {
        match kind {
            AssetKind::Palette => data.get(at..at + 4) == Some(&PALETTE_HEADER[..]),
            AssetKind::Image => {
                data.get(at) == Some(&LZ_TAG) && data.get(at + 1).is_some_and(|b| b % 0x20 == 0)
            }
        }
    }

    fn claim_all(ctx: &mut LoadContext<'_>, kind: AssetKind) -> Result<usize> {
        let decoder = match kind {
            AssetKind::Palette => Decoder::LzPalette,
            AssetKind::Image => Decoder::LzImage,
        };
        let mut found = 0;

        for destination in ctx.mapper.open_destinations() {
            if !Self::looks_like(kind, ctx.data, destination) {
                continue;
            }
            let sizes = match lz77::probe(ctx.data, destination) {
                Ok(sizes) if sizes.uncompressed > 0 => sizes,
                Ok(_) => continue,
                Err(e) if e.is_recoverable() => {
                    trace!("{} candidate at {:#X}: {}", kind, destination, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !ctx
                .storage
                .is_range_free(ctx.data, destination, sizes.compressed)
            {
                continue;
            }

            let run = Run::fixed(RunKind::Compressed(kind), sizes.compressed)
                .with_decoder(decoder.clone());
            ctx.mapper
                .claim(ctx.storage, ctx.data, Arc::new(run), destination)?;
            found += 1;
        }

        Ok(found)
    }
}

impl RunParser for LzAssets {
    fn name(&self) -> &'static str {
        "lz"
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()> {
        let palettes = Self::claim_all(ctx, AssetKind::Palette)?;
        let images = Self::claim_all(ctx, AssetKind::Image)?;
        debug!("Claimed {} palettes and {} images", palettes, images);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::encode_pointer;
    use crate::config::EngineConfig;
    use crate::mapper::PointerMapper;
    use crate::run::{Artifact, RunStorage};

    fn run_lz(data: &[u8]) -> (RunStorage, PointerMapper) {
        let storage = RunStorage::new();
        let mut mapper = PointerMapper::scan(data, 0x08);
        let config = EngineConfig::default();
        let mut conflicts = Vec::new();
        let mut ctx = LoadContext {
            data,
            storage: &storage,
            mapper: &mut mapper,
            config: &config,
            conflicts: &mut conflicts,
        };
        LzAssets.load(&mut ctx).unwrap();
        (storage, mapper)
    }

    #[test]
    fn test_claims_palette_and_image() {
        let palette: Vec<u8> = (0..32).collect();
        let tiles = vec![0x11u8; 64];
        let packed_palette = lz77::compress(&palette).unwrap();
        let packed_tiles = lz77::compress(&tiles).unwrap();

        let mut data = vec![0u8; 0x400];
        data[0x200..0x200 + packed_palette.len()].copy_from_slice(&packed_palette);
        data[0x300..0x300 + packed_tiles.len()].copy_from_slice(&packed_tiles);
        data[0x10..0x14].copy_from_slice(&encode_pointer(0x200, 0x08));
        data[0x14..0x18].copy_from_slice(&encode_pointer(0x300, 0x08));

        let (storage, mapper) = run_lz(&data);

        assert!(mapper.is_claimed(0x200));
        assert!(mapper.is_claimed(0x300));
        assert_eq!(
            storage.run_at(0x200).map(|r| r.kind().clone()),
            Some(RunKind::Compressed(AssetKind::Palette))
        );
        assert_eq!(storage.block_length(&data, 0x300), Some(packed_tiles.len()));
        assert!(storage.is_start_of_run(0x10));

        let ctx = EngineConfig::default();
        let image = storage.artifact(&data, 0x300, &ctx.decode_context());
        assert!(matches!(image.as_deref(), Some(Artifact::Image(_))));
    }

    #[test]
    fn test_skips_broken_and_empty_blobs() {
        let mut data = vec![0u8; 0x400];
        // declares 0x40 bytes but the back-reference reaches before the start
        data[0x200..0x208].copy_from_slice(&[0x10, 0x40, 0x00, 0x00, 0x80, 0xF0, 0xFF, 0x00]);
        // zero-length image
        data[0x300..0x304].copy_from_slice(&[0x10, 0x00, 0x00, 0x00]);
        data[0x10..0x14].copy_from_slice(&encode_pointer(0x200, 0x08));
        data[0x14..0x18].copy_from_slice(&encode_pointer(0x300, 0x08));

        let (storage, mapper) = run_lz(&data);

        assert!(!mapper.is_claimed(0x200));
        assert!(!mapper.is_claimed(0x300));
        assert!(storage.is_empty());
    }
}
