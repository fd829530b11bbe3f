//! Drives a synthetic cartridge through a full load.

use gbascope_core::buffer::encode_pointer;
use gbascope_core::{
    lz77, Artifact, CharacterTable, Coverage, EngineConfig, Profile, RunKind, Session, Title,
};
use pretty_assertions::assert_eq;
use std::fs;
use tempfile::TempDir;

const NAMES: usize = 0x1000;
const NAME_LEN: usize = 11;
const SPECIES: usize = 412;
const PALETTE: usize = 0x3000;
const GREETING: usize = 0x3100;

fn encode(text: &str) -> Vec<u8> {
    let charmap = CharacterTable::english();
    let mut out: Vec<u8> = text.chars().filter_map(|c| charmap.encode(c)).collect();
    out.push(0xFF);
    out
}

fn synthetic_rom() -> Vec<u8> {
    // 0xFF is what unused cartridge space holds
    let mut data = vec![0xFFu8; 0x8000];
    data[0xA0..0xAC].copy_from_slice(b"POKEMON FIRE");
    data[0xAC..0xB0].copy_from_slice(b"BPRE");

    // species names, read through the pointer at 0x144
    data[0x144..0x148].copy_from_slice(&encode_pointer(NAMES, 0x08));
    for i in 0..SPECIES {
        let name = encode(&format!("MON{i}"));
        let at = NAMES + i * NAME_LEN;
        data[at..at + name.len()].copy_from_slice(&name);
    }

    let palette: Vec<u8> = (0..32).collect();
    let packed = lz77::compress(&palette).unwrap();
    data[PALETTE..PALETTE + packed.len()].copy_from_slice(&packed);
    data[0x2400..0x2404].copy_from_slice(&encode_pointer(PALETTE, 0x08));

    // points into the middle of the name table
    data[0x2404..0x2408].copy_from_slice(&encode_pointer(NAMES + 4, 0x08));

    let greeting = encode("WELCOMETOTHEWORLDOFPOKEMON");
    data[GREETING..GREETING + greeting.len()].copy_from_slice(&greeting);
    data[0x2408..0x240C].copy_from_slice(&encode_pointer(GREETING, 0x08));
    data
}

fn loaded() -> (TempDir, Session) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("firered.gba");
    fs::write(&path, synthetic_rom()).unwrap();

    let session = Session::open(&path, EngineConfig::default()).unwrap();
    session.load_blocking().unwrap();
    (dir, session)
}

#[test]
fn test_profile_and_report() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("firered.gba");
    fs::write(&path, synthetic_rom()).unwrap();

    let session = Session::open(&path, EngineConfig::default()).unwrap();
    assert_eq!(session.profile(), Profile::Title(Title::FireRed));

    let report = session.load_blocking().unwrap();
    assert!(session.is_loaded());
    assert!(report.conflicts.is_empty());
    let parsers: Vec<&str> = report.steps.iter().map(|s| s.parser).collect();
    assert_eq!(parsers, vec!["header", "lz", "tables", "strings", "reconcile"]);
    assert_eq!(report.runs, session.runs().len());
}

#[test]
fn test_header_tiles_first_bytes() {
    let (_dir, session) = loaded();
    let coverage = session.query_range(0, 0xC0);
    assert_eq!(coverage.len(), 0xC0);
    assert!(coverage.iter().all(|c| matches!(c, Coverage::Run { .. })));
    assert!(!session.is_within_run(0xC0) && !session.is_start_of_run(0xC0));
}

#[test]
fn test_name_table() {
    let (_dir, session) = loaded();

    assert_eq!(session.shortcut("pokename"), Some(NAMES));
    assert_eq!(session.back_links(NAMES), vec![0x144]);
    assert!(session.is_start_of_run(0x144));
    assert_eq!(session.jump_targets(0x144), vec![NAMES]);

    let fifth = NAMES + 5 * NAME_LEN;
    assert_eq!(session.label(fifth).as_deref(), Some("MON5"));
    assert_eq!(session.block_length(fifth), Some(NAME_LEN));
    match session.run_at(fifth).map(|r| r.kind().clone()) {
        Some(RunKind::Field { schema, name }) => {
            assert_eq!(&*schema, "pokename");
            assert_eq!(&*name, "name");
        }
        other => panic!("unexpected run {other:?}"),
    }

    let artifact = session.artifact(NAMES).unwrap();
    match artifact.as_ref() {
        Artifact::Record(record) => assert_eq!(record.title(), Some("MON0")),
        other => panic!("unexpected artifact {other:?}"),
    }

    // pointers into the table interior are never claimed
    assert!(session.is_within_run(NAMES + 4));
    assert!(session.back_links(NAMES + 4).is_empty());
    assert!(!session.is_start_of_run(0x2404));

    assert!(session.find_by_term("mon7").contains(&(NAMES + 7 * NAME_LEN)));
}

#[test]
fn test_palette_and_text() {
    let (_dir, session) = loaded();

    assert_eq!(session.back_links(PALETTE), vec![0x2400]);
    assert!(matches!(
        session.artifact(PALETTE).as_deref(),
        Some(Artifact::Palette(_))
    ));

    assert_eq!(session.run_at(GREETING).map(|r| r.kind().clone()), Some(RunKind::Text));
    assert_eq!(session.back_links(GREETING), vec![0x2408]);
    assert_eq!(
        session.artifact(GREETING).unwrap().as_text(),
        Some("WELCOMETOTHEWORLDOFPOKEMON")
    );
    assert_eq!(session.find_by_term("welcometotheworldofpokemon"), vec![GREETING]);
}

#[test]
fn test_edit_text_after_load() {
    let (_dir, session) = loaded();
    assert!(session.edit_char(GREETING, 'H').unwrap());
    assert_eq!(
        session.artifact(GREETING).unwrap().as_text(),
        Some("HELCOMETOTHEWORLDOFPOKEMON")
    );
    // inference is not re-run
    assert_eq!(session.run_at(GREETING).map(|r| r.kind().clone()), Some(RunKind::Text));
}

#[test]
fn test_queries_during_load() {
    let session = Session::new(synthetic_rom(), Some("firered.gba"), EngineConfig::default());
    session.load().unwrap();

    // answers reflect whatever has been registered so far
    let coverage = session.query_range(0x1000, 0x40);
    assert_eq!(coverage.len(), 0x40);
    let _ = session.find_by_term("MON1");

    session.wait().unwrap();
    assert!(session.is_loaded());
    assert_eq!(session.shortcut("pokename"), Some(NAMES));
}
