//! Integration tests for XML export and import through files.

use rrdb::error::{FormatError, RrdError};
use rrdb::{ArcDef, ConsolFun, DsDef, DsType, RrdDatabase, RrdDef, RrdDump};
use std::path::Path;
use tempfile::tempdir;

const T0: u64 = 920_805_000;

fn def(path: &Path) -> RrdDef {
    let mut def = RrdDef::new(path, 300);
    def.set_start_time(T0 - 300);
    def.add_datasource(DsDef::new("in", DsType::Derive, 600, Some(0.0), None).unwrap());
    def.add_datasource(DsDef::new("load", DsType::Gauge, 600, None, None).unwrap());
    def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 1, 8).unwrap());
    def.add_archive(ArcDef::new(ConsolFun::Last, 0.5, 4, 4).unwrap());
    def
}

fn feed(db: &RrdDatabase, from: u64, to: u64) {
    for i in from..to {
        #[allow(clippy::cast_precision_loss)]
        let values = [(i * i * 100) as f64, (i % 5) as f64];
        db.update(T0 + i * 300, &values).unwrap();
    }
}

#[test]
fn test_export_import_round_trip() {
    let dir = tempdir().unwrap();
    let xml_path = dir.path().join("dump.xml");

    let source = RrdDatabase::create(&def(&dir.path().join("source.rrd"))).unwrap();
    feed(&source, 0, 11);
    source.export_xml(&xml_path).unwrap();

    let text = std::fs::read_to_string(&xml_path).unwrap();
    assert!(text.starts_with("<?xml"));
    assert!(text.contains("<type>DERIVE</type>"));

    let copy = RrdDatabase::import_xml(dir.path().join("copy.rrd"), &xml_path).unwrap();
    assert_eq!(copy.dump_xml().unwrap(), source.dump_xml().unwrap());

    // Both continue identically, and the copy survives a reopen.
    feed(&source, 11, 20);
    feed(&copy, 11, 20);
    copy.close().unwrap();
    let copy = RrdDatabase::open(dir.path().join("copy.rrd")).unwrap();
    assert_eq!(copy.dump_xml().unwrap(), source.dump_xml().unwrap());
    assert_eq!(
        copy.definition().unwrap().archives,
        source.definition().unwrap().archives
    );
}

#[test]
fn test_edited_dump_is_imported() {
    let dir = tempdir().unwrap();
    let source = RrdDatabase::create(&def(&dir.path().join("source.rrd"))).unwrap();
    feed(&source, 0, 4);

    let mut dump = source.dump().unwrap();
    dump.datasources[1].name = "load1".to_string();
    let xml = dump.to_xml().unwrap();
    let parsed = RrdDump::from_xml(&xml).unwrap();
    assert_eq!(parsed.datasources[1].name, "load1");

    let xml_path = dir.path().join("edited.xml");
    std::fs::write(&xml_path, xml).unwrap();
    let copy = RrdDatabase::import_xml(dir.path().join("edited.rrd"), &xml_path).unwrap();
    assert_eq!(copy.ds_index("load1").unwrap(), 1);
    assert!(copy.ds_index("load").is_err());
}

#[test]
fn test_unsupported_version_is_rejected() {
    let dir = tempdir().unwrap();
    let source = RrdDatabase::create(&def(&dir.path().join("source.rrd"))).unwrap();
    let xml = source
        .dump_xml()
        .unwrap()
        .replace("<version>0003</version>", "<version>0001</version>");
    let xml_path = dir.path().join("old.xml");
    std::fs::write(&xml_path, xml).unwrap();

    assert!(matches!(
        RrdDatabase::import_xml(dir.path().join("old.rrd"), &xml_path),
        Err(RrdError::Format(FormatError::DumpVersion { .. }))
    ));
    assert!(!dir.path().join("old.rrd").exists());
}
