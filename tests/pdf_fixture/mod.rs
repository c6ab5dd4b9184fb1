use lopdf::{Document, Object, Stream, dictionary};

/// An image drawn on one page of a fixture PDF.
#[derive(Debug, Clone, Copy)]
pub struct FixtureImage {
    /// 1-based page number.
    pub page: u32,
    pub width: i64,
    pub height: i64,
}

fn gray_stream(width: i64, height: i64) -> Stream {
    let pixels = vec![96u8; (width * height) as usize];
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

/// A Letter-size PDF with `pages` pages carrying `images`.
pub fn book_pdf(pages: u32, images: &[FixtureImage]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut kids = Vec::new();
    for page in 1..=pages {
        let content = doc.add_object(Stream::new(
            dictionary! {},
            format!("BT /F1 12 Tf 72 720 Td (Page {page}) Tj ET").into_bytes(),
        ));
        let mut xobjects = lopdf::Dictionary::new();
        for (n, image) in images.iter().filter(|i| i.page == page).enumerate() {
            let id = doc.add_object(gray_stream(image.width, image.height));
            xobjects.set(format!("Im{}", n + 1), id);
        }
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content,
            "Resources" => dictionary! { "XObject" => xobjects },
        });
        kids.push(Object::Reference(page_id));
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
    doc.trailer.set("Root", catalog);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialize fixture pdf");
    bytes
}
