//! PDF plumbing on top of `lopdf`: page counts, page-range crops, embedded
//! image lookup and image recompression.

use std::io::Cursor;

use anyhow::Context as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

/// US Letter, used when a page carries no usable MediaBox.
const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);

/// Illustrations smaller than this on either side are treated as decoration.
pub const MIN_ILLUSTRATION_PX: u32 = 100;
/// Images covering more than this share of both page sides are treated as
/// scanned text pages.
pub const FULL_PAGE_RATIO: f32 = 0.9;

pub struct PdfDocument {
    doc: Document,
}

/// An image XObject drawn on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageImage {
    pub id: ObjectId,
    pub width: u32,
    pub height: u32,
}

impl PageImage {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl PdfDocument {
    pub fn load(bytes: &[u8]) -> anyhow::Result<Self> {
        let doc = Document::load_mem(bytes).context("parse pdf")?;
        Ok(Self { doc })
    }

    pub fn page_count(&self) -> u32 {
        self.doc.get_pages().len() as u32
    }

    pub fn to_bytes(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.doc.save_to(&mut out).context("serialize pdf")?;
        Ok(out)
    }

    /// A new document holding pages `first..=last` (1-based, clamped to the
    /// document).
    pub fn crop(&self, first: u32, last: u32) -> anyhow::Result<PdfDocument> {
        let count = self.page_count();
        let first = first.max(1);
        let last = last.min(count);
        if count == 0 || first > last {
            anyhow::bail!("empty page range {first}..={last} in a {count}-page document");
        }
        let mut doc = self.doc.clone();
        let drop: Vec<u32> = (1..=count).filter(|p| *p < first || *p > last).collect();
        if !drop.is_empty() {
            doc.delete_pages(&drop);
            doc.prune_objects();
        }
        Ok(PdfDocument { doc })
    }

    /// Width and height of `page` (1-based) in points.
    pub fn page_size(&self, page: u32) -> (f32, f32) {
        let Some(page_id) = self.page_id(page) else {
            return DEFAULT_PAGE_SIZE;
        };
        let Some(Object::Array(rect)) = self.inherited(page_id, b"MediaBox") else {
            return DEFAULT_PAGE_SIZE;
        };
        let nums: Vec<f32> = rect.iter().filter_map(|o| self.number(o)).collect();
        if nums.len() != 4 {
            return DEFAULT_PAGE_SIZE;
        }
        ((nums[2] - nums[0]).abs(), (nums[3] - nums[1]).abs())
    }

    /// Image XObjects referenced from the resources of `page` (1-based), in
    /// resource-dictionary order.
    pub fn page_images(&self, page: u32) -> Vec<PageImage> {
        let Some(page_id) = self.page_id(page) else {
            return Vec::new();
        };
        let Some(resources) = self
            .inherited(page_id, b"Resources")
            .and_then(|o| self.dict(o))
        else {
            return Vec::new();
        };
        let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| self.dict(o)) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for (_, value) in xobjects.iter() {
            let Object::Reference(id) = value else {
                continue;
            };
            let Ok(Object::Stream(stream)) = self.doc.get_object(*id) else {
                continue;
            };
            if !matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == b"Image") {
                continue;
            }
            let dim = |key: &[u8]| {
                stream
                    .dict
                    .get(key)
                    .ok()
                    .and_then(|o| self.resolve(o))
                    .and_then(|o| o.as_i64().ok())
                    .and_then(|v| u32::try_from(v).ok())
            };
            if let (Some(width), Some(height)) = (dim(b"Width"), dim(b"Height")) {
                out.push(PageImage {
                    id: *id,
                    width,
                    height,
                });
            }
        }
        out
    }

    /// Images on `page` that look like illustrations rather than icons or
    /// scanned text.
    pub fn illustrations(&self, page: u32) -> Vec<PageImage> {
        let (page_w, page_h) = self.page_size(page);
        self.page_images(page)
            .into_iter()
            .filter(|img| is_illustration(img, page_w, page_h))
            .collect()
    }

    /// The largest image on `page`, if any.
    pub fn largest_image(&self, page: u32) -> Option<PageImage> {
        self.page_images(page).into_iter().max_by_key(PageImage::area)
    }

    /// The image as JPEG bytes. DCT streams are passed through, raw and
    /// Flate streams are re-encoded at `quality`.
    pub fn image_jpeg(&self, image: &PageImage, quality: u8) -> anyhow::Result<Vec<u8>> {
        let stream = self
            .doc
            .get_object(image.id)
            .and_then(Object::as_stream)
            .context("image stream")?;
        if stream_filter(stream).as_deref() == Some(b"DCTDecode".as_slice()) {
            return Ok(stream.content.clone());
        }
        let decoded = self.decode_raw(stream)?;
        encode_jpeg(&decoded, quality)
    }

    /// Re-encodes every decodable raster image as JPEG, shrinking it to at
    /// most `max_side` pixels and optionally dropping colour.
    pub fn recompress_images(&mut self, max_side: u32, quality: u8, grayscale: bool) -> usize {
        let ids: Vec<ObjectId> = self
            .doc
            .objects
            .iter()
            .filter(|(_, obj)| {
                matches!(obj, Object::Stream(s)
                    if matches!(s.dict.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == b"Image"))
            })
            .map(|(id, _)| *id)
            .collect();

        let mut rewritten = 0;
        for id in ids {
            let Ok(Object::Stream(stream)) = self.doc.get_object(id) else {
                continue;
            };
            let decoded = match self.decode_any(stream) {
                Ok(img) => img,
                Err(err) => {
                    tracing::debug!(object = ?id, error = %err, "image left untouched");
                    continue;
                }
            };
            let mut img = if decoded.width().max(decoded.height()) > max_side {
                decoded.resize(max_side, max_side, FilterType::Triangle)
            } else {
                decoded
            };
            if grayscale {
                img = DynamicImage::ImageLuma8(img.to_luma8());
            }
            let Ok(jpeg) = encode_jpeg(&img, quality) else {
                continue;
            };

            let gray = matches!(img, DynamicImage::ImageLuma8(_));
            let mut dict = stream.dict.clone();
            dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
            dict.set("Width", i64::from(img.width()));
            dict.set("Height", i64::from(img.height()));
            dict.set("BitsPerComponent", 8);
            dict.set(
                "ColorSpace",
                Object::Name(if gray { b"DeviceGray".to_vec() } else { b"DeviceRGB".to_vec() }),
            );
            dict.remove(b"DecodeParms");
            dict.remove(b"Decode");
            dict.remove(b"Length");
            let replacement = Stream::new(dict, jpeg).with_compression(false);
            self.doc.objects.insert(id, Object::Stream(replacement));
            rewritten += 1;
        }
        self.doc.compress();
        rewritten
    }

    fn decode_any(&self, stream: &Stream) -> anyhow::Result<DynamicImage> {
        if stream_filter(stream).as_deref() == Some(b"DCTDecode".as_slice()) {
            return image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
                .context("decode jpeg");
        }
        self.decode_raw(stream)
    }

    /// Unfiltered or Flate-compressed 8-bit DeviceRGB / DeviceGray samples.
    fn decode_raw(&self, stream: &Stream) -> anyhow::Result<DynamicImage> {
        let filter = stream_filter(stream);
        let data = match filter.as_deref() {
            None => stream.content.clone(),
            Some(b"FlateDecode") => stream.decompressed_content().context("inflate image")?,
            Some(other) => anyhow::bail!(
                "unsupported image filter {}",
                String::from_utf8_lossy(other)
            ),
        };

        let get_u32 = |key: &[u8]| {
            stream
                .dict
                .get(key)
                .ok()
                .and_then(|o| self.resolve(o))
                .and_then(|o| o.as_i64().ok())
                .and_then(|v| u32::try_from(v).ok())
        };
        let width = get_u32(b"Width").context("image width")?;
        let height = get_u32(b"Height").context("image height")?;
        let bits = get_u32(b"BitsPerComponent").unwrap_or(8);
        if bits != 8 {
            anyhow::bail!("unsupported bits per component: {bits}");
        }

        let components = match stream.dict.get(b"ColorSpace").ok().and_then(|o| self.resolve(o)) {
            Some(Object::Name(name)) if name.as_slice() == b"DeviceRGB" => 3,
            Some(Object::Name(name)) if name.as_slice() == b"DeviceGray" => 1,
            Some(Object::Array(items))
                if matches!(items.first(), Some(Object::Name(n)) if n.as_slice() == b"ICCBased") =>
            {
                items
                    .get(1)
                    .and_then(|o| self.resolve(o))
                    .and_then(|o| o.as_stream().ok())
                    .and_then(|s| s.dict.get(b"N").ok())
                    .and_then(|o| o.as_i64().ok())
                    .unwrap_or(3)
            }
            _ => anyhow::bail!("unsupported colour space"),
        };

        let expected = width as usize * height as usize * components as usize;
        if data.len() < expected {
            anyhow::bail!("image data too short: {} < {expected}", data.len());
        }
        let data = data[..expected].to_vec();
        let img = match components {
            1 => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
            n => anyhow::bail!("unsupported component count: {n}"),
        };
        img.context("image buffer size mismatch")
    }

    fn page_id(&self, page: u32) -> Option<ObjectId> {
        self.doc.get_pages().get(&page).copied()
    }

    /// Looks `key` up on the page, then on its ancestors in the page tree.
    fn inherited(&self, page_id: ObjectId, key: &[u8]) -> Option<&Object> {
        let mut current = self.doc.get_dictionary(page_id).ok();
        let mut depth = 0;
        while let Some(dict) = current {
            if let Ok(value) = dict.get(key) {
                return self.resolve(value);
            }
            depth += 1;
            if depth > 32 {
                return None;
            }
            current = dict
                .get(b"Parent")
                .ok()
                .and_then(|o| o.as_reference().ok())
                .and_then(|id| self.doc.get_dictionary(id).ok());
        }
        None
    }

    fn resolve<'a>(&'a self, obj: &'a Object) -> Option<&'a Object> {
        match obj {
            Object::Reference(id) => self.doc.get_object(*id).ok(),
            other => Some(other),
        }
    }

    fn dict<'a>(&'a self, obj: &'a Object) -> Option<&'a Dictionary> {
        self.resolve(obj).and_then(|o| o.as_dict().ok())
    }

    fn number(&self, obj: &Object) -> Option<f32> {
        match self.resolve(obj)? {
            Object::Integer(i) => Some(*i as f32),
            Object::Real(r) => Some(*r as f32),
            _ => None,
        }
    }
}

pub fn is_illustration(image: &PageImage, page_width: f32, page_height: f32) -> bool {
    if image.width < MIN_ILLUSTRATION_PX || image.height < MIN_ILLUSTRATION_PX {
        return false;
    }
    let full_page = image.width as f32 > FULL_PAGE_RATIO * page_width
        && image.height as f32 > FULL_PAGE_RATIO * page_height;
    !full_page
}

/// The single filter applied to `stream`, if any.
fn stream_filter(stream: &Stream) -> Option<Vec<u8>> {
    match stream.dict.get(b"Filter").ok()? {
        Object::Name(name) => Some(name.clone()),
        Object::Array(items) => match items.as_slice() {
            [Object::Name(name)] => Some(name.clone()),
            [] => None,
            _ => Some(b"<chain>".to_vec()),
        },
        _ => None,
    }
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    let flattened = match image {
        DynamicImage::ImageLuma8(_) => image.clone(),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    };
    flattened.write_with_encoder(encoder).context("encode jpeg")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use lopdf::dictionary;

    use super::*;

    fn gray_stream(width: i64, height: i64) -> Stream {
        let pixels = vec![128u8; (width * height) as usize];
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            pixels,
        )
        .with_compression(false)
    }

    /// Three Letter-size pages; page 2 carries a small, a medium and a
    /// full-page image.
    fn sample() -> anyhow::Result<PdfDocument> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let small = doc.add_object(gray_stream(50, 50));
        let medium = doc.add_object(gray_stream(200, 150));
        let full = doc.add_object(gray_stream(600, 780));

        let mut kids = Vec::new();
        for page in 1..=3 {
            let content = doc.add_object(Stream::new(dictionary! {}, b"q Q".to_vec()));
            let resources = if page == 2 {
                dictionary! {
                    "XObject" => dictionary! { "Im1" => small, "Im2" => medium, "Im3" => full },
                }
            } else {
                dictionary! {}
            };
            let id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content,
                "Resources" => resources,
            });
            kids.push(Object::Reference(id));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => 3,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)?;
        PdfDocument::load(&bytes)
    }

    #[test]
    fn crop_clamps_and_keeps_range() -> anyhow::Result<()> {
        let pdf = sample()?;
        assert_eq!(pdf.page_count(), 3);

        let mut cropped = pdf.crop(2, 9)?;
        assert_eq!(cropped.page_count(), 2);
        assert_eq!(cropped.page_images(1).len(), 3);

        let reloaded = PdfDocument::load(&cropped.to_bytes()?)?;
        assert_eq!(reloaded.page_count(), 2);
        assert!(pdf.crop(3, 2).is_err());
        Ok(())
    }

    #[test]
    fn page_size_is_inherited_from_page_tree() -> anyhow::Result<()> {
        let pdf = sample()?;
        assert_eq!(pdf.page_size(1), (612.0, 792.0));
        assert_eq!(pdf.page_size(99), DEFAULT_PAGE_SIZE);
        Ok(())
    }

    #[test]
    fn illustrations_skip_icons_and_full_page_scans() -> anyhow::Result<()> {
        let pdf = sample()?;
        let found = pdf.illustrations(2);
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].width, found[0].height), (200, 150));
        assert!(pdf.illustrations(1).is_empty());

        assert_eq!(pdf.largest_image(2).map(|i| i.width), Some(600));
        Ok(())
    }

    #[test]
    fn illustration_thresholds() {
        let img = |width, height| PageImage {
            id: (1, 0),
            width,
            height,
        };
        assert!(!is_illustration(&img(99, 500), 612.0, 792.0));
        assert!(!is_illustration(&img(500, 99), 612.0, 792.0));
        assert!(is_illustration(&img(100, 100), 612.0, 792.0));
        assert!(!is_illustration(&img(560, 720), 612.0, 792.0));
        assert!(is_illustration(&img(600, 300), 612.0, 792.0));
    }

    #[test]
    fn raw_images_become_jpeg() -> anyhow::Result<()> {
        let pdf = sample()?;
        let image = pdf.illustrations(2)[0];
        let jpeg = pdf.image_jpeg(&image, 95)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (200, 150));
        Ok(())
    }

    #[test]
    fn recompress_shrinks_large_images() -> anyhow::Result<()> {
        let mut pdf = sample()?;
        assert_eq!(pdf.recompress_images(300, 40, true), 3);
        let reloaded = PdfDocument::load(&pdf.to_bytes()?)?;
        let largest = reloaded.largest_image(2).expect("image survives");
        assert!(largest.width.max(largest.height) <= 300);
        let jpeg = reloaded.image_jpeg(&largest, 90)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }
}
