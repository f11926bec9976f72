use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use recon_fixtures::case::RawConversion;
use recon_fixtures::checksum::{ChecksumTable, bytes_checksum, file_checksum};
use recon_fixtures::converter::Converter;
use recon_fixtures::error::FixtureError;
use recon_fixtures::signature::{SignatureComputer, composite_signature};
use recon_fixtures::store::Store;

struct Setup {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
    store: Store,
}

fn setup() -> Setup {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new(root.join("data"));
    Setup {
        _temp: temp,
        root,
        store,
    }
}

fn converter_at(path: &Utf8Path, content: &[u8]) -> Converter {
    fs::write(path.as_std_path(), content).unwrap();
    Converter::from_path(path.as_std_path().to_path_buf(), Duration::from_secs(5)).unwrap()
}

fn computer(store: &Store, source: &[u8], converter: Converter) -> SignatureComputer {
    let mut checksums = ChecksumTable::default();
    checksums.insert("scan.dat", bytes_checksum(source));
    SignatureComputer::new(store.clone(), Arc::new(checksums), Arc::new(converter))
}

#[test]
fn signature_is_stable_for_identical_inputs() {
    let setup = setup();
    let raw = RawConversion::new("scan.dat", "2");
    let output = setup.store.data_root().join("case/main.h5");
    let converter = converter_at(&setup.root.join("conv"), b"binary v1");

    let first = computer(&setup.store, b"raw bytes", converter.clone())
        .compute(&raw, &output)
        .unwrap();
    let second = computer(&setup.store, b"raw bytes", converter)
        .compute(&raw, &output)
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn signature_binds_source_command_and_binary() {
    let setup = setup();
    let raw = RawConversion::new("scan.dat", "2");
    let output = setup.store.data_root().join("case/main.h5");
    let converter = converter_at(&setup.root.join("conv"), b"binary v1");
    let baseline = computer(&setup.store, b"raw bytes", converter.clone())
        .compute(&raw, &output)
        .unwrap();

    let source_changed = computer(&setup.store, b"raw bytez", converter.clone())
        .compute(&raw, &output)
        .unwrap();
    assert_ne!(baseline, source_changed);

    let signatures = computer(&setup.store, b"raw bytes", converter);
    let mut measurement = raw.clone();
    measurement.measurement = "1".to_string();
    assert_ne!(baseline, signatures.compute(&measurement, &output).unwrap());

    let mut flagged = raw.clone();
    flagged.data_conversion_flag = "--flashPatRef".to_string();
    assert_ne!(baseline, signatures.compute(&flagged, &output).unwrap());

    let mut xsl = raw.clone();
    xsl.parameter_xsl = "IsmrmrdParameterMap_Siemens_EPI.xsl".to_string();
    assert_ne!(baseline, signatures.compute(&xsl, &output).unwrap());

    let moved = setup.store.data_root().join("other/main.h5");
    assert_ne!(baseline, signatures.compute(&raw, &moved).unwrap());

    let rebuilt = converter_at(&setup.root.join("conv"), b"binary v2");
    let binary_changed = computer(&setup.store, b"raw bytes", rebuilt)
        .compute(&raw, &output)
        .unwrap();
    assert_ne!(baseline, binary_changed);
}

#[test]
fn signature_matches_documented_formula() {
    let setup = setup();
    let raw = RawConversion::new("scan.dat", "2");
    let output = setup.store.data_root().join("case/main.h5");
    let conv_path = setup.root.join("siemens_to_ismrmrd");
    let converter = converter_at(&conv_path, b"binary v1");
    let signatures = computer(&setup.store, b"raw bytes", converter);

    let command = format!(
        "siemens_to_ismrmrd -X -f {} -m IsmrmrdParameterMap_Siemens.xml \
         -x IsmrmrdParameterMap_Siemens.xsl -o {output} -z 2  ",
        setup.store.cached_file("scan.dat")
    );
    assert_eq!(signatures.command(&raw, &output).rendered(), command);

    let expected = composite_signature(
        &bytes_checksum(b"raw bytes"),
        &command,
        &file_checksum(Path::new(conv_path.as_str())).unwrap(),
    );
    assert_eq!(signatures.compute(&raw, &output).unwrap(), expected);
}

#[test]
fn unknown_source_is_a_lookup_failure() {
    let setup = setup();
    let converter = converter_at(&setup.root.join("conv"), b"binary v1");
    let signatures = computer(&setup.store, b"raw bytes", converter);
    let raw = RawConversion::new("not-listed.dat", "1");

    assert_matches!(
        signatures.compute(&raw, &setup.store.data_root().join("x/main.h5")),
        Err(FixtureError::ChecksumNotFound(file)) if file == "not-listed.dat"
    );
}
