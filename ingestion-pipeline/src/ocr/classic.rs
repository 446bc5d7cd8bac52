use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use common::{error::AppError, storage::types::document::OcrEngineKind};
use image::{GrayImage, ImageFormat};
use tokio::process::Command;
use tracing::debug;

use super::{AvailabilityCache, Confidence, EngineProfile, OcrExecutor, Recognition};

/// TSV row level of a single recognized word.
const WORD_LEVEL: &str = "5";
const FRAKTUR_MODEL: &str = "deu_frak";

/// Runs the `tesseract` executable on a temporary PNG and reads its TSV output.
pub struct TesseractExecutor {
    binary: PathBuf,
    available: AvailabilityCache,
}

impl TesseractExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            available: AvailabilityCache::default(),
        }
    }

    fn page_segmentation(profile: EngineProfile) -> &'static str {
        match profile {
            EngineProfile::Default => "3",
            EngineProfile::SingleColumn => "6",
            EngineProfile::Sparse => "11",
            EngineProfile::HistoricScript => "13",
        }
    }

    fn languages(profile: EngineProfile, hints: &[String]) -> String {
        let mut languages: Vec<&str> = Vec::with_capacity(hints.len() + 1);
        if profile == EngineProfile::HistoricScript {
            languages.push(FRAKTUR_MODEL);
        }
        for hint in hints {
            if !languages.contains(&hint.as_str()) {
                languages.push(hint);
            }
        }
        if languages.is_empty() {
            languages.push("eng");
        }
        languages.join("+")
    }
}

#[async_trait]
impl OcrExecutor for TesseractExecutor {
    fn kind(&self) -> OcrEngineKind {
        OcrEngineKind::Classic
    }

    async fn is_available(&self) -> bool {
        self.available
            .get_or_check(|| async {
                Command::new(&self.binary)
                    .arg("--version")
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map(|output| output.status.success())
                    .unwrap_or(false)
            })
            .await
    }

    async fn reset_availability(&self) {
        self.available.reset().await;
    }

    async fn execute(
        &self,
        image: &GrayImage,
        profile: EngineProfile,
        language_hints: &[String],
    ) -> Result<Recognition, AppError> {
        let owned = image.clone();
        let input = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
            let file = tempfile::Builder::new()
                .prefix("ocr-page-")
                .suffix(".png")
                .tempfile()?;
            owned
                .save_with_format(file.path(), ImageFormat::Png)
                .map_err(|err| AppError::Processing(format!("failed to stage OCR image: {err}")))?;
            Ok(file)
        })
        .await??;

        let languages = Self::languages(profile, language_hints);
        let output = Command::new(&self.binary)
            .arg(input.path())
            .arg("stdout")
            .args(["-l", languages.as_str()])
            .args(["--psm", Self::page_segmentation(profile)])
            .args(["--oem", "3"])
            .arg("tsv")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    AppError::OcrEngineUnavailable(format!("{}: {err}", self.binary.display()))
                }
                _ => AppError::Io(err),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Processing(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let recognition = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!(
            languages = %languages,
            chars = recognition.text.chars().count(),
            confidence = recognition.confidence.value(),
            "tesseract finished"
        );
        Ok(recognition)
    }
}

/// Rebuilds text line by line from word rows and averages the word confidences.
///
/// Rows with confidence `-1` are layout rows and do not count.
pub fn parse_tsv(tsv: &str) -> Recognition {
    let mut lines: Vec<String> = Vec::new();
    let mut current_key: Option<(String, String, String)> = None;
    let mut current_block: Option<String> = None;
    let mut confidence_sum = 0.0_f64;
    let mut words = 0_u32;

    for row in tsv.lines().skip(1) {
        let columns: Vec<&str> = row.split('\t').collect();
        let [level, _page, block, paragraph, line, _word, _left, _top, _width, _height, conf, text] =
            columns.as_slice()
        else {
            continue;
        };
        if *level != WORD_LEVEL {
            continue;
        }
        let Ok(conf) = conf.trim().parse::<f64>() else {
            continue;
        };
        let text = text.trim();
        if conf < 0.0 || text.is_empty() {
            continue;
        }
        confidence_sum += conf;
        words += 1;

        let key = ((*block).to_string(), (*paragraph).to_string(), (*line).to_string());
        match lines.last_mut() {
            Some(last) if current_key.as_ref() == Some(&key) => {
                last.push(' ');
                last.push_str(text);
            }
            _ => {
                if current_block.is_some() && current_block.as_deref() != Some(*block) {
                    lines.push(String::new());
                }
                lines.push(text.to_string());
                current_key = Some(key);
                current_block = Some((*block).to_string());
            }
        }
    }

    let confidence = if words == 0 {
        Confidence::ZERO
    } else {
        Confidence::from_percent(confidence_sum / f64::from(words))
    };
    Recognition {
        text: lines.join("\n"),
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn word(block: u32, line: u32, conf: f64, text: &str) -> String {
        format!("5\t1\t{block}\t1\t{line}\t1\t0\t0\t10\t10\t{conf}\t{text}")
    }

    #[test]
    fn tsv_words_are_joined_per_line_and_blocks_separated() {
        let tsv = [
            HEADER.to_string(),
            "1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t".to_string(),
            word(1, 1, 90.0, "Sehr"),
            word(1, 1, 80.0, "geehrte"),
            word(1, 2, 70.0, "Damen"),
            word(2, 1, 60.0, "Anlage"),
        ]
        .join("\n");

        let recognition = parse_tsv(&tsv);
        assert_eq!(recognition.text, "Sehr geehrte\nDamen\n\nAnlage");
        assert!((recognition.confidence.value() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn near_zero_word_confidences_stay_near_zero() {
        let tsv = [
            HEADER.to_string(),
            word(1, 1, 0.0, "xq"),
            word(1, 1, 1.0, "zz"),
        ]
        .join("\n");

        let recognition = parse_tsv(&tsv);
        assert!(recognition.confidence.value() < 0.05);
        assert!((recognition.confidence.value() - 0.005).abs() < 1e-9);
    }

    #[test]
    fn empty_output_has_zero_confidence() {
        let recognition = parse_tsv(HEADER);
        assert!(recognition.text.is_empty());
        assert_eq!(recognition.confidence, Confidence::ZERO);
    }

    #[test]
    fn historic_profile_adds_fraktur_model_first() {
        let hints = vec!["deu".to_string(), "eng".to_string()];
        assert_eq!(
            TesseractExecutor::languages(EngineProfile::HistoricScript, &hints),
            "deu_frak+deu+eng"
        );
        assert_eq!(
            TesseractExecutor::languages(EngineProfile::Default, &hints),
            "deu+eng"
        );
        assert_eq!(TesseractExecutor::languages(EngineProfile::Sparse, &[]), "eng");
        assert_eq!(
            TesseractExecutor::page_segmentation(EngineProfile::HistoricScript),
            "13"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let executor = TesseractExecutor::new("/nonexistent/tesseract-binary");
        assert!(!executor.is_available().await);
        let err = executor
            .execute(&GrayImage::new(8, 8), EngineProfile::Default, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OcrEngineUnavailable(_)));
    }
}
