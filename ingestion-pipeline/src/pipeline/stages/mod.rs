use std::sync::Arc;

use common::{
    error::AppError,
    storage::types::document::{Document, OcrEngineKind},
};
use futures::future::join_all;
use state_machines::core::GuardError;
use tracing::{debug, info, instrument, warn};

use super::{
    context::PipelineContext,
    state::{
        Assembled, ConceptsMatched, Discovered, ExtractionNative, ExtractionOcr, Failed, Hashed,
        IngestionMachine, Indexed, MetadataExtracted, SkippedUnchanged,
    },
};
use crate::{
    assembler::{AssemblyInput, DocumentAssembler},
    concepts::ConceptMatcher,
    metadata::MetadataInput,
    ocr::{
        detector::HandwritingDetector, preprocess::PreprocessSelector, router::OcrEngineRouter,
        signals::ImageSample, OcrJob, OcrResult, PreprocessingMode,
    },
    utils::{
        file_kind::{classify, guess_mime_type},
        file_text_extraction::NativeText,
        hashing::hash_owned,
        pdf_ingestion::RasterPage,
    },
};

/// Which extraction branch a file took.
pub enum Extracted {
    Native(IngestionMachine<(), ExtractionNative>),
    Ocr(IngestionMachine<(), ExtractionOcr>),
}

#[instrument(
    level = "trace",
    skip_all,
    fields(path = %ctx.path_key, directory_id = %ctx.reference.directory_id)
)]
pub async fn hash_content(
    machine: IngestionMachine<(), Discovered>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Hashed>, AppError> {
    let bytes = match ctx.services.read_bytes(ctx.reference).await {
        Ok(bytes) => bytes,
        Err(err) => return Err(fail(machine.abort(), err)),
    };
    let mime_type = guess_mime_type(&ctx.reference.path);
    let kind = classify(&ctx.reference.path, &mime_type);
    let hash = match hash_owned(bytes.clone()).await {
        Ok(hash) => hash,
        Err(err) => return Err(fail(machine.abort(), err)),
    };

    debug!(
        path = %ctx.path_key,
        hash = %hash.short(),
        kind = kind.as_str(),
        mime_type = %mime_type,
        size = bytes.len(),
        "file hashed"
    );

    ctx.bytes = bytes;
    ctx.mime_type = mime_type;
    ctx.kind = kind;
    ctx.hash = Some(hash);

    machine
        .hash()
        .map_err(|(_, guard)| map_guard_error("hash", &guard))
}

pub fn skip_unchanged(
    machine: IngestionMachine<(), Hashed>,
    ctx: &PipelineContext<'_>,
) -> Result<IngestionMachine<(), SkippedUnchanged>, AppError> {
    debug!(path = %ctx.path_key, "content unchanged since last index");
    machine
        .skip_unchanged()
        .map_err(|(_, guard)| map_guard_error("skip_unchanged", &guard))
}

pub fn record_alias(
    machine: IngestionMachine<(), Hashed>,
) -> Result<IngestionMachine<(), Indexed>, AppError> {
    machine
        .record_alias()
        .map_err(|(_, guard)| map_guard_error("record_alias", &guard))
}

/// Native text when the format yields enough of it, OCR otherwise.
///
/// A failed native extractor falls through to OCR only for kinds that can be rasterized.
#[instrument(
    level = "trace",
    skip_all,
    fields(path = %ctx.path_key, kind = ctx.kind.as_str())
)]
pub async fn extract(
    machine: IngestionMachine<(), Hashed>,
    ctx: &mut PipelineContext<'_>,
) -> Result<Extracted, AppError> {
    let threshold = ctx.pipeline_config.tuning.min_native_text_chars;
    let kind = ctx.kind;

    let native = match ctx.services.extract_native(kind, ctx.bytes.clone()).await {
        Ok(native) => native,
        Err(err) if kind.permits_ocr() => {
            warn!(
                path = %ctx.path_key,
                error = %err,
                "native extraction failed, falling back to OCR"
            );
            NativeText::default()
        }
        Err(err) => return Err(fail(machine.abort(), err)),
    };

    let native_chars = native.char_count();
    if native_chars >= threshold || !kind.permits_ocr() {
        info!(
            path = %ctx.path_key,
            native_chars,
            "using native text"
        );
        ctx.text = native.text();
        ctx.native = native;
        return machine
            .extract_native()
            .map_err(|(_, guard)| map_guard_error("extract_native", &guard))
            .map(Extracted::Native);
    }

    let pages = match ctx.services.rasterize(kind, ctx.bytes.clone()).await {
        Ok(pages) if !pages.is_empty() => pages,
        rendered => {
            let err = rendered.err().unwrap_or_else(|| {
                AppError::Extraction("no pages could be rendered for OCR".into())
            });
            if native_chars == 0 {
                return Err(fail(machine.abort(), err));
            }
            warn!(
                path = %ctx.path_key,
                native_chars,
                error = %err,
                "rasterization failed, keeping the short native text"
            );
            ctx.text = native.text();
            ctx.native = native;
            return machine
                .extract_native()
                .map_err(|(_, guard)| map_guard_error("extract_native", &guard))
                .map(Extracted::Native);
        }
    };

    info!(
        path = %ctx.path_key,
        native_chars,
        pages = pages.len(),
        "native text too short, running OCR"
    );
    let ocr_pages = match recognize_pages(ctx, pages).await {
        Ok(ocr_pages) => ocr_pages,
        Err(err) => return Err(fail(machine.abort(), err)),
    };
    ctx.text = merge_pages(&ocr_pages);
    ctx.native = native;
    ctx.ocr_pages = ocr_pages;

    machine
        .extract_ocr()
        .map_err(|(_, guard)| map_guard_error("extract_ocr", &guard))
        .map(Extracted::Ocr)
}

/// Recognizes every page concurrently; results come back in page order.
async fn recognize_pages(
    ctx: &PipelineContext<'_>,
    mut pages: Vec<RasterPage>,
) -> Result<Vec<OcrResult>, AppError> {
    pages.sort_by_key(|page| page.page);
    let tuning = &ctx.pipeline_config.tuning;
    let detector = HandwritingDetector::new(tuning.detector);
    let selector = PreprocessSelector::new(tuning.selector);
    let router = OcrEngineRouter::new(tuning.min_acceptable_confidence);
    let neural_available = ctx.services.neural_available().await;

    let samples = join_all(pages.into_iter().map(|page| {
        tokio::task::spawn_blocking(move || {
            ImageSample::analyze(page.page, Arc::new(page.image), page.dpi)
        })
    }))
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()?;

    let recognized = join_all(samples.into_iter().map(|sample| {
        let handwriting = detector.is_handwriting(&sample.signals);
        let mode = selector.select(&sample.signals, handwriting, ctx.pipeline_config.forced_mode);
        let plan = router.plan(handwriting, neural_available, ctx.pipeline_config.forced_engine);
        let services = ctx.services;
        let hints = tuning.language_hints.clone();
        let path = ctx.path_key.as_str();
        async move {
            debug!(
                path = %path,
                page = sample.page,
                edge_density = sample.signals.edge_density,
                pixel_variance = sample.signals.pixel_variance,
                handwriting,
                mode = %mode,
                engine = %plan.primary.kind,
                "page routed"
            );
            let routed = router
                .run(plan, |engine| {
                    services.recognize(OcrJob {
                        page: sample.page,
                        image: Arc::clone(&sample.image),
                        mode,
                        engine,
                        language_hints: hints.clone(),
                        estimated_dpi: sample.signals.estimated_dpi,
                        handwriting,
                    })
                })
                .await;
            (routed.result, mode)
        }
    }))
    .await;

    let engines: Vec<OcrEngineKind> = recognized
        .iter()
        .map(|(result, _)| result.engine_used)
        .collect();
    let modes: Vec<PreprocessingMode> = recognized.iter().map(|(_, mode)| *mode).collect();
    let results: Vec<OcrResult> = recognized.into_iter().map(|(result, _)| result).collect();
    ctx.stats
        .record_ocr(
            &engines,
            &modes,
            results.iter().any(|result| result.handwriting_detected),
        )
        .await;

    Ok(results)
}

fn merge_pages(pages: &[OcrResult]) -> String {
    pages
        .iter()
        .map(|page| page.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[instrument(level = "trace", skip_all, fields(path = %ctx.path_key))]
pub async fn extract_metadata(
    extracted: Extracted,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), MetadataExtracted>, AppError> {
    let first_page_text = ctx.native.pages.first().map(String::as_str);
    let metadata = ctx
        .services
        .extract_metadata(&MetadataInput {
            reference: ctx.reference,
            kind: ctx.kind,
            mime_type: &ctx.mime_type,
            bytes: &ctx.bytes,
            first_page_text,
        })
        .await;
    debug!(path = %ctx.path_key, fields = metadata.len(), "metadata ready");
    ctx.metadata = metadata;

    match extracted {
        Extracted::Native(machine) => machine
            .extract_metadata()
            .map_err(|(_, guard)| map_guard_error("extract_metadata", &guard)),
        Extracted::Ocr(machine) => machine
            .extract_metadata()
            .map_err(|(_, guard)| map_guard_error("extract_metadata", &guard)),
    }
}

pub fn match_concepts(
    machine: IngestionMachine<(), MetadataExtracted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), ConceptsMatched>, AppError> {
    let matcher = ConceptMatcher::new(ctx.pipeline_config.tuning.match_inner_concepts);
    ctx.concepts = matcher.match_concepts(ctx.ontologies, &ctx.text, &ctx.metadata);

    machine
        .match_concepts()
        .map_err(|(_, guard)| map_guard_error("match_concepts", &guard))
}

pub fn assemble(
    machine: IngestionMachine<(), ConceptsMatched>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Assembled>, AppError> {
    let hash = match ctx.hash() {
        Ok(hash) => hash.clone(),
        Err(err) => return Err(fail(machine.abort(), err)),
    };
    let assembler = DocumentAssembler::new(ctx.pipeline_config.tuning.min_acceptable_confidence);
    let document = assembler.assemble(AssemblyInput {
        hash,
        reference: ctx.reference,
        mime_type: ctx.mime_type.clone(),
        kind: ctx.kind,
        text: std::mem::take(&mut ctx.text),
        metadata: std::mem::take(&mut ctx.metadata),
        concepts: std::mem::take(&mut ctx.concepts),
        ocr_pages: &ctx.ocr_pages,
    });
    ctx.document = Some(document);

    machine
        .assemble()
        .map_err(|(_, guard)| map_guard_error("assemble", &guard))
}

#[instrument(level = "trace", skip_all, fields(path = %ctx.path_key))]
pub async fn index(
    machine: IngestionMachine<(), Assembled>,
    ctx: &mut PipelineContext<'_>,
) -> Result<(IngestionMachine<(), Indexed>, Document), AppError> {
    let document = match ctx.take_document() {
        Ok(document) => document,
        Err(err) => return Err(fail(machine.abort(), err)),
    };
    if let Err(err) = ctx.sink.upsert(&document).await {
        return Err(fail(machine.abort(), err));
    }

    let machine = machine
        .index()
        .map_err(|(_, guard)| map_guard_error("index", &guard))?;
    Ok((machine, document))
}

/// Hands back `err` once the machine has moved to `Failed`.
pub fn fail<M>(
    aborted: Result<IngestionMachine<(), Failed>, (M, GuardError)>,
    err: AppError,
) -> AppError {
    match aborted {
        Ok(_failed) => err,
        Err((_, guard)) => map_guard_error("abort", &guard),
    }
}

pub fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid ingestion pipeline transition during {event}: {guard:?}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::discovered;

    #[test]
    fn failing_keeps_the_original_error() {
        let err = fail(
            discovered().abort(),
            AppError::Io(std::io::Error::other("permission denied")),
        );
        assert!(matches!(err, AppError::Io(_)));

        let hashed = discovered().hash().ok().expect("hash");
        let err = fail(hashed.abort(), AppError::Sink("connection reset".into()));
        assert!(err.is_fatal());
    }
}
