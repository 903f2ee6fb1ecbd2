//! Minimal ISOBMFF (ISO Base Media File Format) box inspection for fMP4
//! segments delivered over HLS/CMAF.
//!
//! This crate provides just enough parsing to decide whether a downloaded
//! body is a plausible media segment: it reads the leading box header and
//! classifies the FourCC. It deliberately does not walk the full box tree;
//! the downloader only needs to tell fMP4 apart from an upstream error
//! payload (typically JSON or HTML) served with a 200 status.

/// FourCCs that may legally open an fMP4 media or init segment.
///
/// `ftyp`/`moov` open init segments, `styp`/`moof`/`mdat`/`sidx` open media
/// fragments, and some packagers emit a leading `free` box for padding.
pub const SEGMENT_LEADING_BOXES: &[[u8; 4]] = &[
    *b"ftyp", *b"styp", *b"moof", *b"mdat", *b"sidx", *b"free", *b"moov",
];

/// A parsed box header: size of the whole box, its FourCC, and the number of
/// header bytes consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub size: usize,
    pub fourcc: [u8; 4],
    pub header_len: usize,
}

/// Read a box header from the start of `data`.
///
/// Handles 32-bit size, 64-bit extended size (`size == 1`), and
/// box-extends-to-EOF (`size == 0`). Returns `None` when `data` is too short
/// to contain the header.
pub fn read_box_header(data: &[u8]) -> Option<BoxHeader> {
    if data.len() < 8 {
        return None;
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: [u8; 4] = [data[4], data[5], data[6], data[7]];

    if size == 1 {
        // 64-bit extended size
        if data.len() < 16 {
            return None;
        }
        let ext_size = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        Some(BoxHeader {
            size: ext_size as usize,
            fourcc,
            header_len: 16,
        })
    } else if size == 0 {
        // Box extends to end of data
        Some(BoxHeader {
            size: data.len(),
            fourcc,
            header_len: 8,
        })
    } else {
        Some(BoxHeader {
            size: size as usize,
            fourcc,
            header_len: 8,
        })
    }
}

/// The FourCC of the first box in `data`, if a header can be read at all.
pub fn leading_fourcc(data: &[u8]) -> Option<[u8; 4]> {
    read_box_header(data).map(|h| h.fourcc)
}

/// Whether `data` opens with a box type that can start an fMP4 segment.
///
/// A `false` result means the body is not a media segment. Callers decide
/// what that implies; a transcoding origin frequently answers a segment
/// request with a JSON error while the segment is still being produced.
pub fn is_segment(data: &[u8]) -> bool {
    match leading_fourcc(data) {
        Some(fourcc) => SEGMENT_LEADING_BOXES.contains(&fourcc),
        None => false,
    }
}

/// Whether the FourCC is printable ASCII, a cheap sanity check on top of the
/// membership test for callers that want to log the observed type.
pub fn fourcc_display(fourcc: [u8; 4]) -> String {
    fourcc
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}
