use std::io::Write as _;

use super::artifacts::names;
use super::{extsort, filter_symbols, ConvertError, PassContext};

pub(super) const PASS_REVISIONS: &str = "sort-revisions";
pub(super) const PASS_SYMBOLS: &str = "sort-symbols";

// The stream keys are fixed-width hex, so a plain lexicographic line sort
// groups revisions by `(metadata, timestamp)` and symbol items by symbol.
// Sorting is external: memory stays bounded however large the archive is.

pub(super) fn run_sort_revisions(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 5: sort revision stream");
    sort_stream(
        ctx,
        names::REV_STREAM,
        names::REV_STREAM_SORTED,
        PASS_REVISIONS,
    )
}

pub(super) fn run_sort_symbols(ctx: &PassContext<'_>) -> Result<(), ConvertError> {
    tracing::info!("pass 6: sort symbol stream");
    sort_stream(
        ctx,
        names::SYMBOL_STREAM,
        names::SYMBOL_STREAM_SORTED,
        PASS_SYMBOLS,
    )
}

fn sort_stream(
    ctx: &PassContext<'_>,
    input_name: &str,
    output_name: &str,
    pass: &str,
) -> Result<(), ConvertError> {
    ctx.progress.set_progress(format!("sorting {input_name}"));

    let mut input = ctx
        .artifacts
        .open(input_name, filter_symbols::PASS)
        .map_err(|e| {
            tracing::error!("failed to open \"{input_name}\": {e}");
            ConvertError
        })?;

    let mut output = ctx.artifacts.create(output_name, pass).map_err(|e| {
        tracing::error!("failed to create \"{output_name}\": {e}");
        ConvertError
    })?;

    extsort::sort_lines(&mut input, &mut output, ctx.options.sort_run_bytes).map_err(|e| {
        tracing::error!("external sort failed: {e}");
        ConvertError
    })?;

    output
        .flush()
        .and_then(|()| ctx.artifacts.commit(&[output_name]))
        .map_err(|e| {
            tracing::error!("failed to finish \"{output_name}\": {e}");
            ConvertError
        })
}
