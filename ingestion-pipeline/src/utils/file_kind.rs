use std::path::Path;

use common::storage::types::document::FileKind;
use mime_guess::from_path;

/// MIME type guessed from the path's extension.
pub fn guess_mime_type(path: &Path) -> String {
    from_path(path)
        .first_or(mime::APPLICATION_OCTET_STREAM)
        .to_string()
}

/// Picks the extraction family for a file once, at pipeline entry.
pub fn classify(path: &Path, mime_type: &str) -> FileKind {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if mime_type == "application/pdf" || extension == "pdf" {
        return FileKind::Pdf;
    }
    if mime_type.starts_with("image/") {
        return FileKind::Image;
    }
    if is_office_extension(&extension) {
        return FileKind::Office;
    }
    if mime_type.starts_with("text/")
        || matches!(
            extension.as_str(),
            "txt" | "md" | "csv" | "json" | "xml" | "html" | "htm" | "eml"
        )
    {
        return FileKind::Text;
    }
    FileKind::Generic
}

fn is_office_extension(extension: &str) -> bool {
    matches!(
        extension,
        "docx" | "docm" | "xlsx" | "xlsm" | "pptx" | "pptm" | "odt" | "ods" | "odp" | "odg" | "odf"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(name: &str) -> FileKind {
        let path = Path::new(name);
        classify(path, &guess_mime_type(path))
    }

    #[test]
    fn classifies_common_families() {
        assert_eq!(kind_of("scan.PDF"), FileKind::Pdf);
        assert_eq!(kind_of("page.tiff"), FileKind::Image);
        assert_eq!(kind_of("photo.jpeg"), FileKind::Image);
        assert_eq!(kind_of("brief.docx"), FileKind::Office);
        assert_eq!(kind_of("tabelle.ods"), FileKind::Office);
        assert_eq!(kind_of("notes.md"), FileKind::Text);
        assert_eq!(kind_of("archive.7z"), FileKind::Generic);
        assert_eq!(kind_of("no_extension"), FileKind::Generic);
    }

    #[test]
    fn unknown_extensions_fall_back_to_octet_stream() {
        assert_eq!(
            guess_mime_type(Path::new("blob.zzz")),
            "application/octet-stream"
        );
    }
}
