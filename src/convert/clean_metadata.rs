use super::artifacts::names;
use super::options::Encoding;
use super::stores::{self, MetadataRecord};
use super::{collect, ConvertError, PassContext};

pub(super) const PASS: &str = "clean-metadata";

// Re-encodes every interned author and log message to UTF-8, trying the
// configured candidate encodings in order. A record no candidate can decode
// aborts the pass; downstream passes rely on metadata being clean.

pub(super) fn run(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 2: clean metadata");
    ctx.progress.set_progress("cleaning metadata".into());

    let records = stores::read_metadata(ctx.artifacts, names::METADATA, collect::PASS)
        .map_err(|e| {
            tracing::error!("failed to read metadata: {e}");
            ConvertError
        })?;

    let mut clean = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let author = decode_any(&record.author, &ctx.options.encodings);
        let log = decode_any(&record.log, &ctx.options.encodings);
        let (Some(author), Some(log)) = (author, log) else {
            tracing::error!(
                "metadata {index:x} cannot be decoded with any configured encoding \
                 (author \"{}\")",
                record.author.escape_ascii(),
            );
            return Err(ConvertError);
        };

        clean.push(MetadataRecord {
            digest: record.digest,
            author: author.into_bytes(),
            log: log.into_bytes(),
        });
    }

    tracing::info!("cleaned {} metadata records", clean.len());

    stores::write_metadata(ctx.artifacts, names::METADATA_CLEAN, PASS, &clean)
        .and_then(|()| ctx.artifacts.commit(&[names::METADATA_CLEAN]))
        .map_err(|e| {
            tracing::error!("failed to write clean metadata: {e}");
            ConvertError
        })
}

fn decode_any(raw: &[u8], encodings: &[Encoding]) -> Option<String> {
    encodings.iter().find_map(|encoding| encoding.decode(raw))
}

#[cfg(test)]
mod tests {
    use super::decode_any;
    use crate::convert::options::Encoding;

    #[test]
    fn first_matching_encoding_wins() {
        let encodings = [Encoding::Utf8, Encoding::Latin1];
        assert_eq!(
            decode_any("héllo".as_bytes(), &encodings).unwrap(),
            "héllo",
        );
        // 0xE9 is not valid UTF-8, so latin1 takes it.
        assert_eq!(decode_any(b"h\xe9llo", &encodings).unwrap(), "héllo");
    }

    #[test]
    fn undecodable_record() {
        assert_eq!(decode_any(b"h\xe9llo", &[Encoding::Ascii]), None);
    }
}
