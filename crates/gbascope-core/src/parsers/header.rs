use super::{LoadContext, RunParser};
use crate::error::Result;
use crate::run::{Decoder, EditRule, Run, RunKind};
use std::sync::Arc;
use tracing::debug;

/// Bytes covered by the cartridge header
pub const HEADER_LEN: usize = 0xC0;

/// Where the four-letter game code lives
pub const GAME_CODE_OFFSET: usize = 0xAC;

/// (name, length, printable)
const ENTRIES: [(&str, usize, bool); 12] = [
    ("ROM Entry Point", 4, false),
    ("Nintendo Logo", 156, false),
    ("Game Title", 12, true),
    ("Game Code", 4, true),
    ("Maker Code", 2, true),
    ("Fixed Value", 1, false),
    ("Main Unit Code", 1, false),
    ("Device Type", 1, false),
    ("Reserved Area", 7, false),
    ("Software Version", 1, false),
    ("Complement Check", 1, false),
    ("Reserved Area", 2, false),
];

/// The game code, if the header holds four ASCII alphanumerics there
pub fn game_code(data: &[u8]) -> Option<String> {
    let code = data.get(GAME_CODE_OFFSET..GAME_CODE_OFFSET + 4)?;
    code.iter()
        .all(u8::is_ascii_alphanumeric)
        .then(|| String::from_utf8_lossy(code).into_owned())
}

/// Registers the cartridge header and drops pointers into it
#[derive(Debug, Clone, Copy, Default)]
pub struct Header;

impl RunParser for Header {
    fn name(&self) -> &'static str {
        "header"
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()> {
        if ctx.data.len() < HEADER_LEN {
            debug!("Buffer is {} bytes, too short for a header", ctx.data.len());
            return Ok(());
        }

        let mut offset = 0;
        for (name, len, printable) in ENTRIES {
            let run = Run::fixed(RunKind::Header(name), len).with_editor(EditRule::Hex);
            let run = if printable {
                run.with_decoder(Decoder::Ascii)
            } else {
                run
            };
            ctx.storage.add_run(ctx.data, offset, Arc::new(run))?;
            offset += len;
        }

        ctx.mapper
            .filter_pointers(|destination| destination >= HEADER_LEN);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::mapper::PointerMapper;
    use crate::run::RunStorage;

    #[test]
    fn test_header_runs() {
        let mut data = vec![0u8; 0x200];
        data[0xA0..0xAC].copy_from_slice(b"POKEMON FIRE");
        data[0xAC..0xB0].copy_from_slice(b"BPRE");
        data[0xB0..0xB2].copy_from_slice(b"01");
        // a pointer into the header and one past it
        data[0x100..0x104].copy_from_slice(&[0x40, 0x00, 0x00, 0x08]);
        data[0x104..0x108].copy_from_slice(&[0x80, 0x01, 0x00, 0x08]);

        let storage = RunStorage::new();
        let mut mapper = PointerMapper::scan(&data, 0x08);
        let config = EngineConfig::default();
        let mut conflicts = Vec::new();
        let mut ctx = LoadContext {
            data: &data,
            storage: &storage,
            mapper: &mut mapper,
            config: &config,
            conflicts: &mut conflicts,
        };
        Header.load(&mut ctx).unwrap();

        assert_eq!(storage.len(), 12);
        assert!(storage.is_start_of_run(0xA0));
        assert!(storage.is_start_of_run(0xBE));
        assert_eq!(storage.block_length(&data, 0x04), Some(156));
        assert!(storage.is_free(&data, HEADER_LEN));
        assert_eq!(mapper.open_destinations(), vec![0x180]);

        let title = storage.artifact(&data, 0xA0, &config.decode_context());
        assert_eq!(title.and_then(|a| a.as_text().map(str::to_owned)).as_deref(), Some("POKEMON FIRE"));
    }

    #[test]
    fn test_game_code() {
        let mut data = vec![0u8; 0xC0];
        assert_eq!(game_code(&data), None);
        data[0xAC..0xB0].copy_from_slice(b"AXVE");
        assert_eq!(game_code(&data).as_deref(), Some("AXVE"));
        assert_eq!(game_code(&data[..0xAE]), None);
    }
}
