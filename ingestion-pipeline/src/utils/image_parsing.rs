use std::{collections::BTreeMap, io::Cursor};

use common::error::AppError;
use exif::{In, Tag};
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const INCHES_PER_METER: f64 = 39.370_1;
const CM_PER_INCH: f64 = 2.54;

/// Header facts read without decoding the full raster.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: Option<ImageFormat>,
    /// Decoder colour type, e.g. `Rgb8` or `L8`.
    pub color: String,
    pub dpi: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub dpi: Option<u32>,
}

pub fn read_header(bytes: &[u8]) -> Result<ImageInfo, AppError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let format = reader.format();
    let decoder = reader
        .into_decoder()
        .map_err(|err| AppError::Extraction(format!("unreadable image header: {err}")))?;
    let (width, height) = decoder.dimensions();
    Ok(ImageInfo {
        width,
        height,
        format,
        color: format!("{:?}", decoder.color_type()),
        dpi: declared_dpi(bytes),
    })
}

/// EXIF tags kept as metadata, by field name.
const EXIF_TEXT_TAGS: &[(Tag, &str)] = &[
    (Tag::DateTime, "datetime"),
    (Tag::Make, "camera_make"),
    (Tag::Model, "camera_model"),
    (Tag::Software, "software"),
    (Tag::Artist, "artist"),
    (Tag::Copyright, "copyright"),
    (Tag::ImageDescription, "image_description"),
    (Tag::DateTimeOriginal, "photo_taken_date"),
];

/// Facts from the EXIF block of a TIFF, JPEG, PNG, WebP or HEIF container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExifFacts {
    pub text: BTreeMap<&'static str, String>,
    pub has_gps: bool,
}

/// `Ok(None)` when the image simply carries no EXIF block.
pub fn read_exif(bytes: &[u8]) -> Result<Option<ExifFacts>, AppError> {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(None),
        Err(err) => return Err(AppError::Extraction(format!("unreadable EXIF block: {err}"))),
    };

    let mut facts = ExifFacts::default();
    for (tag, name) in EXIF_TEXT_TAGS {
        if let Some(value) = exif_text(&exif, *tag) {
            facts.text.insert(name, value);
        }
    }
    facts.has_gps = exif.get_field(Tag::GPSLatitude, In::PRIMARY).is_some()
        && exif.get_field(Tag::GPSLongitude, In::PRIMARY).is_some();
    Ok(Some(facts))
}

fn exif_text(exif: &exif::Exif, tag: Tag) -> Option<String> {
    let exif::Value::Ascii(parts) = &exif.get_field(tag, In::PRIMARY)?.value else {
        return None;
    };
    let text = parts
        .iter()
        .map(|part| String::from_utf8_lossy(part).trim_end_matches('\0').trim().to_string())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!text.is_empty()).then_some(text)
}

/// Decodes the first frame; multi-page TIFFs contribute only their first page.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, AppError> {
    let image = image::load_from_memory(bytes)
        .map_err(|err| AppError::Extraction(format!("failed to decode image: {err}")))?;
    Ok(DecodedImage {
        image,
        dpi: declared_dpi(bytes),
    })
}

/// Resolution stored in a PNG `pHYs` chunk or a JFIF header, if any.
pub fn declared_dpi(bytes: &[u8]) -> Option<u32> {
    if bytes.starts_with(PNG_SIGNATURE) {
        png_dpi(bytes)
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        jfif_dpi(bytes)
    } else {
        None
    }
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(at..at.checked_add(4)?)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let raw: [u8; 2] = bytes.get(at..at.checked_add(2)?)?.try_into().ok()?;
    Some(u16::from_be_bytes(raw))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn round_dpi(value: f64) -> Option<u32> {
    (value.is_finite() && value >= 1.0).then(|| value.round() as u32)
}

fn png_dpi(bytes: &[u8]) -> Option<u32> {
    let mut offset = PNG_SIGNATURE.len();
    loop {
        let length = usize::try_from(be_u32(bytes, offset)?).ok()?;
        let kind = bytes.get(offset + 4..offset + 8)?;
        let data = offset + 8;
        match kind {
            b"pHYs" => {
                let per_unit = be_u32(bytes, data)?;
                // Unit 0 only fixes the aspect ratio.
                if *bytes.get(data + 8)? != 1 {
                    return None;
                }
                return round_dpi(f64::from(per_unit) / INCHES_PER_METER);
            }
            b"IDAT" | b"IEND" => return None,
            _ => offset = data.checked_add(length)?.checked_add(4)?,
        }
    }
}

fn jfif_dpi(bytes: &[u8]) -> Option<u32> {
    // APP0 must directly follow SOI for JFIF files.
    if bytes.get(2..4)? != [0xFF, 0xE0].as_slice() || bytes.get(6..11)? != b"JFIF\0".as_slice() {
        return None;
    }
    let units = *bytes.get(13)?;
    let density = f64::from(be_u16(bytes, 14)?);
    match units {
        1 => round_dpi(density),
        2 => round_dpi(density * CM_PER_INCH),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};

    fn with_phys(png: &[u8], pixels_per_meter: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&pixels_per_meter.to_be_bytes());
        data.extend_from_slice(&pixels_per_meter.to_be_bytes());
        data.push(1);
        with_chunk(png, b"pHYs", &data)
    }

    #[test]
    fn header_reads_dimensions_and_format() {
        let info = read_header(&png_bytes(31, 17)).expect("header");
        assert_eq!((info.width, info.height), (31, 17));
        assert_eq!(info.format, Some(ImageFormat::Png));
        assert_eq!(info.color, "L8");
        assert_eq!(info.dpi, None);
    }

    #[test]
    fn png_phys_chunk_yields_dpi() {
        let png = with_phys(&png_bytes(4, 4), 11_811);
        assert_eq!(declared_dpi(&png), Some(300));
    }

    #[test]
    fn jfif_density_yields_dpi() {
        let mut header = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        header.extend_from_slice(b"JFIF\0");
        header.extend_from_slice(&[1, 1, 1, 0, 72, 0, 72, 0, 0]);
        assert_eq!(declared_dpi(&header), Some(72));
    }

    #[test]
    fn garbage_is_not_an_image() {
        assert!(decode(b"definitely not an image").is_err());
        assert_eq!(declared_dpi(b"\x89PNG\r\n\x1a\n\x00"), None);
    }

    fn rational(tag: Tag) -> exif::Field {
        exif::Field {
            tag,
            ifd_num: In::PRIMARY,
            value: exif::Value::Rational(vec![(52, 1).into(), (31, 1).into(), (0, 1).into()]),
        }
    }

    #[test]
    fn exif_text_tags_and_gps_are_read() {
        let bytes = exif_block(&[
            ascii(Tag::Make, "Canon"),
            ascii(Tag::Model, "EOS 5D"),
            ascii(Tag::Artist, "Stadtarchiv"),
            ascii(Tag::DateTime, "2021:03:04 10:11:12"),
            ascii(Tag::DateTimeOriginal, "1987:06:01 08:00:00"),
            rational(Tag::GPSLatitude),
            rational(Tag::GPSLongitude),
        ]);

        let facts = read_exif(&bytes).expect("readable").expect("exif present");
        assert_eq!(facts.text.get("camera_make").map(String::as_str), Some("Canon"));
        assert_eq!(facts.text.get("camera_model").map(String::as_str), Some("EOS 5D"));
        assert_eq!(facts.text.get("artist").map(String::as_str), Some("Stadtarchiv"));
        assert_eq!(
            facts.text.get("photo_taken_date").map(String::as_str),
            Some("1987:06:01 08:00:00")
        );
        assert!(facts.has_gps);
    }

    #[test]
    fn png_exif_chunk_is_read() {
        let block = exif_block(&[ascii(Tag::Software, "ScanStation 2")]);
        let png = with_chunk(&png_bytes(4, 4), b"eXIf", &block);

        let facts = read_exif(&png).expect("readable").expect("exif present");
        assert_eq!(
            facts.text.get("software").map(String::as_str),
            Some("ScanStation 2")
        );
        assert!(!facts.has_gps);
        assert_eq!(read_header(&png).expect("header").width, 4);
    }

    #[test]
    fn images_without_exif_have_none() {
        assert_eq!(read_exif(&png_bytes(4, 4)).expect("readable"), None);
    }

    #[test]
    fn truncated_exif_is_an_error() {
        let mut bytes = b"II*\0\x08\0\0\0".to_vec();
        bytes.extend_from_slice(&[0xff, 0x7f, 0x0f]);
        assert!(read_exif(&bytes).is_err());
    }
}
