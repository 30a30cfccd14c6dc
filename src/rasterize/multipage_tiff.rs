//! Splitting multipage TIFFs into PNG pages.
//!
//! The `image` crate only ever decodes the first frame of a TIFF, but scanners
//! love producing one TIFF per document with one IFD per page. So we walk the
//! IFD chain ourselves.
//!
//! Pages can also hide in SubIFDs. Thumbnails, masks and DNG data there are
//! safe to skip, but anything that might be a page is an error, so that we
//! never return a document with pages silently missing.

use std::io::{Cursor, Read, Seek};

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use tiff::{
    ColorType, Directory,
    decoder::{Decoder, DecodingResult, ifd::Value},
    tags::{IfdPointer, Tag},
};

use crate::{errors::RasterizationError, model::PageImage, prelude::*};

/// NewSubfileType bits, as defined by TIFF 6.0.
mod subfile_type {
    /// Thumbnail or preview.
    pub const REDUCED_RESOLUTION: u32 = 0x1;
    /// One page of a multipage document.
    pub const SINGLE_PAGE: u32 = 0x2;
    /// Transparency mask for another image.
    pub const TRANSPARENCY_MASK: u32 = 0x4;
    /// DNG depth map, enhanced image and semantic mask.
    pub const DNG_BITS: u32 = 0x8 | 0x10 | 0x10000;
}

/// Decode every IFD in a TIFF and re-encode each one as a PNG page.
pub(super) fn split_tiff(content: &[u8]) -> Result<Vec<PageImage>, RasterizationError> {
    let mut decoder = Decoder::new(Cursor::new(content)).map_err(decode_error)?;
    let mut pages = vec![];
    loop {
        let ifd_index = pages.len();
        check_subifds(&mut decoder, ifd_index)?;
        let image = decode_current_ifd(&mut decoder, ifd_index)?;
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|err| {
                RasterizationError::Decode(format!(
                    "failed to encode TIFF page {} as PNG: {}",
                    ifd_index, err
                ))
            })?;
        pages.push(PageImage::new("image/png", png));

        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(decode_error)?;
    }
    debug!(page_count = pages.len(), "Split multipage TIFF");
    Ok(pages)
}

fn decode_error(err: tiff::TiffError) -> RasterizationError {
    RasterizationError::Decode(format!("invalid TIFF: {}", err))
}

/// Make sure the current IFD has no SubIFDs that might hold pages.
fn check_subifds<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    ifd_index: usize,
) -> Result<(), RasterizationError> {
    let offsets = match decoder.find_tag(Tag::SubIfd) {
        Ok(Some(Value::Ifd(offset))) => vec![u64::from(offset)],
        Ok(Some(Value::List(list))) => list
            .iter()
            .filter_map(|value| match value {
                Value::Ifd(offset) => Some(u64::from(*offset)),
                _ => None,
            })
            .collect(),
        _ => return Ok(()),
    };

    for (sub_idx, offset) in offsets.into_iter().enumerate() {
        let subdir = match decoder.read_directory(IfdPointer(offset)) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(ifd_index, sub_idx, "Could not read SubIFD: {}", err);
                continue;
            }
        };
        let kind = new_subfile_type(decoder, &subdir);
        let skippable = subfile_type::REDUCED_RESOLUTION
            | subfile_type::TRANSPARENCY_MASK
            | subfile_type::DNG_BITS;
        if kind & skippable != 0 {
            debug!(ifd_index, sub_idx, kind, "Skipping non-page SubIFD");
            continue;
        }
        if kind == 0 || kind & subfile_type::SINGLE_PAGE != 0 {
            return Err(RasterizationError::Decode(format!(
                "TIFF IFD {} has a SubIFD ({}, NewSubfileType={}) that may contain \
                 pages we cannot read; convert the TIFF to PDF or separate images",
                ifd_index, sub_idx, kind
            )));
        }
    }
    Ok(())
}

/// NewSubfileType of a SubIFD, defaulting to 0.
fn new_subfile_type<R: Read + Seek>(decoder: &mut Decoder<R>, subdir: &Directory) -> u32 {
    let mut ifd_decoder = decoder.read_directory_tags(subdir);
    match ifd_decoder.find_tag(Tag::NewSubfileType) {
        Ok(Some(value)) => value.into_u32().unwrap_or(0),
        _ => 0,
    }
}

/// Decode the IFD the decoder is currently positioned on.
fn decode_current_ifd<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    ifd_index: usize,
) -> Result<DynamicImage, RasterizationError> {
    let (width, height) = decoder.dimensions().map_err(decode_error)?;
    let color_type = decoder.colortype().map_err(decode_error)?;
    let samples = match decoder.read_image().map_err(decode_error)? {
        DecodingResult::U8(data) => data,
        // Scale 16-bit samples down to 8 bits.
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => {
            return Err(RasterizationError::Decode(format!(
                "unsupported TIFF sample format in IFD {}",
                ifd_index
            )));
        }
    };

    let too_short = || {
        RasterizationError::Decode(format!(
            "TIFF IFD {} has fewer samples than its {}x{} dimensions",
            ifd_index, width, height
        ))
    };
    let image = match color_type {
        // Bilevel scans and fax pages, packed several pixels per byte.
        ColorType::Gray(bits @ (1 | 2 | 4)) => {
            let samples = unpack_gray(&samples, width, height, bits).ok_or_else(too_short)?;
            DynamicImage::ImageLuma8(
                GrayImage::from_raw(width, height, samples).ok_or_else(too_short)?,
            )
        }
        ColorType::Gray(_) => DynamicImage::ImageLuma8(
            GrayImage::from_raw(width, height, samples).ok_or_else(too_short)?,
        ),
        ColorType::RGB(_) => DynamicImage::ImageRgb8(
            RgbImage::from_raw(width, height, samples).ok_or_else(too_short)?,
        ),
        ColorType::RGBA(_) => DynamicImage::ImageRgba8(
            RgbaImage::from_raw(width, height, samples).ok_or_else(too_short)?,
        ),
        other => {
            return Err(RasterizationError::Decode(format!(
                "unsupported TIFF color type {:?} in IFD {}",
                other, ifd_index
            )));
        }
    };
    Ok(image)
}

/// Expand grayscale samples of fewer than 8 bits into one byte per pixel,
/// scaled to 0..=255. Each row of `packed` starts on a byte boundary.
fn unpack_gray(packed: &[u8], width: u32, height: u32, bits: u8) -> Option<Vec<u8>> {
    let (width, height, bits) = (width as usize, height as usize, usize::from(bits));
    if width == 0 || height == 0 {
        return None;
    }
    let row_bytes = (width * bits).div_ceil(8);
    if packed.len() < row_bytes * height {
        return None;
    }
    let max = (1u16 << bits) - 1;
    let mut pixels = Vec::with_capacity(width * height);
    for row in packed.chunks_exact(row_bytes).take(height) {
        for x in 0..width {
            let bit_offset = x * bits;
            let shift = 8 - bits - bit_offset % 8;
            let value = u16::from(row[bit_offset / 8] >> shift) & max;
            pixels.push((value * 255 / max) as u8);
        }
    }
    Some(pixels)
}

#[cfg(test)]
mod tests {
    use tiff::encoder::{TiffEncoder, colortype};

    use super::*;

    /// Build an in-memory TIFF with one grayscale IFD per entry in `sizes`.
    fn multipage_tiff(sizes: &[(u32, u32)]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buffer).expect("encoder");
            for &(width, height) in sizes {
                let pixels = vec![128u8; (width * height) as usize];
                encoder
                    .write_image::<colortype::Gray8>(width, height, &pixels)
                    .expect("write page");
            }
        }
        buffer.into_inner()
    }

    /// Build a little-endian, uncompressed, BlackIsZero grayscale TIFF by hand,
    /// with `bits` per pixel. If `subifd_kind` is set, the image also points at
    /// a SubIFD with that NewSubfileType.
    fn hand_built_tiff(
        width: u16,
        height: u16,
        bits: u16,
        packed: &[u8],
        subifd_kind: Option<u32>,
    ) -> Vec<u8> {
        const SHORT: u16 = 3;
        const LONG: u16 = 4;
        const IFD: u16 = 13;

        let entry_count = if subifd_kind.is_some() { 10 } else { 9 };
        let data_offset = 8 + 2 + 12 * entry_count + 4;
        let subifd_offset = (data_offset + packed.len()).next_multiple_of(2);

        let mut entries: Vec<(u16, u16, u32)> = vec![
            (256, SHORT, u32::from(width)),
            (257, SHORT, u32::from(height)),
            (258, SHORT, u32::from(bits)),
            (259, SHORT, 1),
            (262, SHORT, 1),
            (273, LONG, data_offset as u32),
            (277, SHORT, 1),
            (278, SHORT, u32::from(height)),
            (279, LONG, packed.len() as u32),
        ];
        if subifd_kind.is_some() {
            entries.push((330, IFD, subifd_offset as u32));
        }

        let mut tiff = b"II*\0".to_vec();
        tiff.extend_from_slice(&8u32.to_le_bytes());
        tiff.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (tag, kind, value) in entries {
            tiff.extend_from_slice(&tag.to_le_bytes());
            tiff.extend_from_slice(&kind.to_le_bytes());
            tiff.extend_from_slice(&1u32.to_le_bytes());
            tiff.extend_from_slice(&value.to_le_bytes());
        }
        tiff.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(tiff.len(), data_offset);
        tiff.extend_from_slice(packed);

        if let Some(kind) = subifd_kind {
            tiff.resize(subifd_offset, 0);
            tiff.extend_from_slice(&1u16.to_le_bytes());
            tiff.extend_from_slice(&254u16.to_le_bytes());
            tiff.extend_from_slice(&LONG.to_le_bytes());
            tiff.extend_from_slice(&1u32.to_le_bytes());
            tiff.extend_from_slice(&kind.to_le_bytes());
            tiff.extend_from_slice(&0u32.to_le_bytes());
        }
        tiff
    }

    /// A 10x2 bilevel image. Rows are padded to 2 bytes.
    const BILEVEL_10X2: [u8; 4] = [0b1010_0000, 0b1100_0000, 0xFF, 0b1100_0000];

    #[test]
    fn splits_each_ifd_into_a_png_page() -> Result<()> {
        let tiff = multipage_tiff(&[(4, 3), (2, 2), (5, 1)]);
        let pages = split_tiff(&tiff)?;
        assert_eq!(pages.len(), 3);
        let first = image::load_from_memory(&pages[0].data)?;
        assert_eq!((first.width(), first.height()), (4, 3));
        let last = image::load_from_memory(&pages[2].data)?;
        assert_eq!((last.width(), last.height()), (5, 1));
        assert!(pages.iter().all(|page| page.mime_type == "image/png"));
        Ok(())
    }

    #[test]
    fn bilevel_scans_are_unpacked() -> Result<()> {
        let tiff = hand_built_tiff(10, 2, 1, &BILEVEL_10X2, None);
        let pages = split_tiff(&tiff)?;
        assert_eq!(pages.len(), 1);
        let page = image::load_from_memory(&pages[0].data)?.to_luma8();
        assert_eq!(page.dimensions(), (10, 2));
        let first_row = (0..10).map(|x| page.get_pixel(x, 0)[0]).collect::<Vec<_>>();
        assert_eq!(first_row, [255, 0, 255, 0, 0, 0, 0, 0, 255, 255]);
        assert!((0..10).all(|x| page.get_pixel(x, 1)[0] == 255));
        Ok(())
    }

    #[test]
    fn unpacks_sub_byte_samples() {
        assert_eq!(unpack_gray(&[0xF0], 2, 1, 4), Some(vec![255, 0]));
        assert_eq!(unpack_gray(&[0b1001_0000], 2, 1, 2), Some(vec![170, 85]));
        assert_eq!(unpack_gray(&[0xFF], 9, 1, 1), None);
        assert_eq!(unpack_gray(&[], 0, 0, 1), None);
    }

    #[test]
    fn thumbnail_subifds_are_skipped() -> Result<()> {
        let kind = Some(subfile_type::REDUCED_RESOLUTION);
        let pages = split_tiff(&hand_built_tiff(10, 2, 1, &BILEVEL_10X2, kind))?;
        assert_eq!(pages.len(), 1);
        Ok(())
    }

    #[test]
    fn subifds_that_may_be_pages_are_rejected() {
        for kind in [0, subfile_type::SINGLE_PAGE] {
            let tiff = hand_built_tiff(10, 2, 1, &BILEVEL_10X2, Some(kind));
            match split_tiff(&tiff) {
                Err(RasterizationError::Decode(msg)) => assert!(msg.contains("SubIFD")),
                other => panic!("expected SubIFD error, got {:?}", other),
            }
        }
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            split_tiff(b"II*\0garbage"),
            Err(RasterizationError::Decode(_))
        ));
    }
}
