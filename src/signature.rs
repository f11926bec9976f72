use std::sync::Arc;

use camino::Utf8Path;

use crate::case::RawConversion;
use crate::checksum::{ChecksumTable, bytes_checksum, concat_checksum};
use crate::converter::{ConversionCommand, Converter};
use crate::error::FixtureError;
use crate::store::Store;

/// Derives composite signatures for converted artifacts.
///
/// `md5(source_md5 ++ md5(command) ++ converter_md5)`, in that order, over the lowercase hex
/// strings. Two artifacts share a signature exactly when they come from the same source bytes,
/// the same invocation and the same converter binary.
#[derive(Debug, Clone)]
pub struct SignatureComputer {
    store: Store,
    checksums: Arc<ChecksumTable>,
    converter: Arc<Converter>,
}

impl SignatureComputer {
    pub fn new(store: Store, checksums: Arc<ChecksumTable>, converter: Arc<Converter>) -> Self {
        Self {
            store,
            checksums,
            converter,
        }
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    pub fn checksums(&self) -> &ChecksumTable {
        &self.checksums
    }

    /// The invocation producing `output` from the cached copy of `raw.data_file`.
    pub fn command(&self, raw: &RawConversion, output: &Utf8Path) -> ConversionCommand {
        let source = self.store.cached_file(&raw.data_file);
        self.converter.command(raw, &source, output)
    }

    pub fn compute(&self, raw: &RawConversion, output: &Utf8Path) -> Result<String, FixtureError> {
        let source_checksum = self.checksums.lookup(&raw.data_file)?;
        let command = self.command(raw, output);
        Ok(composite_signature(
            source_checksum,
            command.rendered(),
            self.converter.digest(),
        ))
    }
}

pub fn composite_signature(source_checksum: &str, command: &str, converter_digest: &str) -> String {
    let command_checksum = bytes_checksum(command.as_bytes());
    concat_checksum([
        source_checksum.as_bytes(),
        command_checksum.as_bytes(),
        converter_digest.as_bytes(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_of_inputs_matters() {
        let forward = composite_signature("aaa", "cmd", "bbb");
        let swapped = composite_signature("bbb", "cmd", "aaa");
        assert_ne!(forward, swapped);
        assert_eq!(forward, composite_signature("aaa", "cmd", "bbb"));
        assert_eq!(forward.len(), 32);
    }
}
