// SPDX-License-Identifier: GPL-2.0-or-later

#[cfg(test)]
mod test;

use thiserror::Error;

// Mpeg box type.
pub type BoxType = [u8; 4];

// The closed set of box types the sniffer will recognize.
const KNOWN_TYPES: [BoxType; 50] = [
    *b"ftyp", *b"styp", *b"mvhd", *b"moov", *b"moof", *b"mfhd", *b"tfdt",
    *b"trun", *b"tfhd", *b"traf", *b"mvex", *b"mehd", *b"trex", *b"trak",
    *b"mdia", *b"tkhd", *b"mdat", *b"free", *b"skip", *b"mdhd", *b"hdlr",
    *b"minf", *b"vmhd", *b"dinf", *b"dref", *b"stbl", *b"stsd", *b"stsz",
    *b"stz2", *b"stts", *b"stss", *b"stsc", *b"stco", *b"co64", *b"smhd",
    *b"sidx", *b"saiz", *b"saio", *b"btrt", *b"tenc", *b"pssh", *b"senc",
    *b"sinf", *b"frma", *b"schm", *b"schi", *b"uuid", *b"abst", *b"asrt",
    *b"afrt",
];

/*********************** TypeSniffer *************************/

// Sliding window over the last four bytes of input, classified
// against the closed fourCC set above.
#[derive(Default)]
pub struct TypeSniffer {
    window: [u8; 4],
    len: usize,
}

impl TypeSniffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Appends a byte, dropping the oldest one once four are held.
    pub fn add(&mut self, byte: u8) {
        if self.len < 4 {
            self.window[self.len] = byte;
            self.len += 1;
            return;
        }
        self.window.rotate_left(1);
        self.window[3] = byte;
    }

    // Returns the matching box type if the current window is a
    // member of the fourCC set.
    #[must_use]
    pub fn classify(&self) -> Option<BoxType> {
        if self.len < 4 {
            return None;
        }
        KNOWN_TYPES.contains(&self.window).then_some(self.window)
    }
}

/************************* Reader ***************************/

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnmarshalError {
    #[error("unexpected end of input: want {0} more bytes, got {1}")]
    UnexpectedEnd(usize, usize),
}

// Cursor over a box buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn slice(&mut self, n: usize) -> Result<&'a [u8], UnmarshalError> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(UnmarshalError::UnexpectedEnd(n, remaining));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u8(&mut self) -> Result<u8, UnmarshalError> {
        Ok(self.slice(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, UnmarshalError> {
        let b = self.slice(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, UnmarshalError> {
        let b = self.slice(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, UnmarshalError> {
        let b = self.slice(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_type(&mut self) -> Result<BoxType, UnmarshalError> {
        let b = self.slice(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }
}

/*********************** BoxHeader **************************/

// Size 1 is reserved for the extended header and is never a
// legitimate one byte box.
const EXTENDED_SIZE_MARKER: u32 = 1;

// Parsed box header. `header_size` is 8, or 16 when the extended
// 64-bit size field is present. `size` counts the whole box
// including the header.
#[derive(Debug, PartialEq, Eq)]
pub struct BoxHeader {
    pub size: u64,
    pub box_type: BoxType,
    pub header_size: usize,
}

impl BoxHeader {
    pub fn unmarshal(b: &[u8]) -> Result<Self, UnmarshalError> {
        let mut r = Reader::new(b);
        let size = r.read_u32()?;
        if size == EXTENDED_SIZE_MARKER {
            let size = r.read_u64()?;
            let box_type = r.read_type()?;
            return Ok(Self {
                size,
                box_type,
                header_size: 16,
            });
        }
        let box_type = r.read_type()?;
        Ok(Self {
            size: size.into(),
            box_type,
            header_size: 8,
        })
    }
}

/************************ find_box **************************/

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FindBoxError {
    #[error("box not found: '{}'", String::from_utf8_lossy(.0))]
    NotFound(BoxType),
}

// Returns the byte offset of the first `box_type` box in `buf`,
// pointing at its (possibly extended) size header. Callers index
// the parent buffer with the returned offset.
pub fn find_box(buf: &[u8], box_type: BoxType) -> Result<usize, FindBoxError> {
    let mut sniffer = TypeSniffer::new();
    for (i, byte) in buf.iter().enumerate() {
        sniffer.add(*byte);
        if sniffer.classify() != Some(box_type) {
            continue;
        }
        // size(4) [size64(8)] type(4), `i` is the last byte of the type.
        if let Some(ext_start) = i.checked_sub(15) {
            let b = &buf[ext_start..ext_start + 4];
            if u32::from_be_bytes([b[0], b[1], b[2], b[3]]) == EXTENDED_SIZE_MARKER {
                return Ok(ext_start);
            }
        }
        if let Some(start) = i.checked_sub(7) {
            return Ok(start);
        }
    }
    Err(FindBoxError::NotFound(box_type))
}

/********************** ImmutableBox ************************/

// ImmutableBox is the common trait of boxes.
pub trait ImmutableBox {
    // Type returns the BoxType.
    fn box_type(&self) -> BoxType;

    // Size returns the marshaled size in bytes.
    // The size must be known before marshaling
    // since the box header contains the size.
    fn size(&self) -> usize;

    // Marshal box to writer.
    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error>;
}

#[derive(Debug, Error)]
pub enum Mp4Error {
    #[error("write: {0}")]
    Write(#[from] std::io::Error),

    #[error("from int: {0} {1}")]
    FromInt(String, std::num::TryFromIntError),
}

// Tree of boxes that can be marshaled together.
pub struct Boxes {
    pub mp4_box: Box<dyn ImmutableBox>,
    pub children: Vec<Boxes>,
}

impl Boxes {
    // Size returns the total size of the box including children.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut total = self.mp4_box.size() + 8;

        for child in &self.children {
            let size = child.size();
            total += size;
        }

        total
    }

    // Marshal box including children.
    pub fn marshal(&self, w: &mut impl std::io::Write) -> Result<(), Mp4Error> {
        let size = self.size();

        write_box_info(w, size, self.mp4_box.box_type())?;

        // The size of a empty box is 8 bytes.
        if size != 8 {
            self.mp4_box.marshal(w)?;
        }

        for child in &self.children {
            child.marshal(w)?;
        }
        Ok(())
    }
}

pub fn write_box_info(
    w: &mut impl std::io::Write,
    size: usize,
    typ: BoxType,
) -> Result<(), Mp4Error> {
    w.write_all(
        &u32::try_from(size)
            .map_err(|e| Mp4Error::FromInt("write box info".to_owned(), e))?
            .to_be_bytes(),
    )?;
    w.write_all(&typ)?;
    Ok(())
}

pub fn write_single_box(
    w: &mut impl std::io::Write,
    b: &dyn ImmutableBox,
) -> Result<usize, Mp4Error> {
    let size = 8 + b.size();

    write_box_info(w, size, b.box_type())?;

    // The size of a empty box is 8 bytes.
    if size != 8 {
        b.marshal(w)?;
    }
    Ok(size)
}

/************************* FullBox **************************/

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FullBox {
    pub version: u8,
    pub flags: [u8; 3],
}

impl FullBox {
    fn get_flags(&self) -> u32 {
        (u32::from(self.flags[0]) << 16)
            ^ (u32::from(self.flags[1]) << 8)
            ^ (u32::from(self.flags[2]))
    }

    #[must_use]
    pub fn check_flag(&self, flag: u32) -> bool {
        self.get_flags() & flag != 0
    }

    #[allow(clippy::unused_self)]
    fn field_size(&self) -> usize {
        4
    }

    fn marshal_field(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&[self.version])?;
        w.write_all(&self.flags)?;
        Ok(())
    }

    fn unmarshal_field(r: &mut Reader) -> Result<Self, UnmarshalError> {
        let version = r.read_u8()?;
        let flags = r.slice(3)?;
        Ok(Self {
            version,
            flags: [flags[0], flags[1], flags[2]],
        })
    }
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn u32_to_flags(v: u32) -> [u8; 3] {
    [(v >> 16) as u8, (v >> 8) as u8, v as u8]
}

/*************************** ftyp ****************************/

pub const TYPE_FTYP: BoxType = *b"ftyp";

pub struct Ftyp {
    pub major_brand: [u8; 4],
    pub minor_version: u32,
    pub compatible_brands: Vec<CompatibleBrandElem>,
}

#[repr(transparent)]
pub struct CompatibleBrandElem(pub [u8; 4]);

impl ImmutableBox for Ftyp {
    fn box_type(&self) -> BoxType {
        TYPE_FTYP
    }

    fn size(&self) -> usize {
        8 + self.compatible_brands.len() * 4
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&self.major_brand)?;
        w.write_all(&self.minor_version.to_be_bytes())?;
        for brands in &self.compatible_brands {
            w.write_all(&brands.0)?;
        }
        Ok(())
    }
}

/*************************** mdat ****************************/

pub const TYPE_MDAT: BoxType = *b"mdat";

pub struct Mdat(pub Vec<u8>);

impl ImmutableBox for Mdat {
    fn box_type(&self) -> BoxType {
        TYPE_MDAT
    }

    fn size(&self) -> usize {
        self.0.len()
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        w.write_all(&self.0)?;
        Ok(())
    }
}

/*************************** mfhd ****************************/

pub const TYPE_MFHD: BoxType = *b"mfhd";

pub struct Mfhd {
    pub full_box: FullBox,
    pub sequence_number: u32,
}

impl ImmutableBox for Mfhd {
    fn box_type(&self) -> BoxType {
        TYPE_MFHD
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.sequence_number.to_be_bytes())?;
        Ok(())
    }
}

/*************************** moof ****************************/

pub const TYPE_MOOF: BoxType = *b"moof";

pub struct Moof {}

impl ImmutableBox for Moof {
    fn box_type(&self) -> BoxType {
        TYPE_MOOF
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

/*************************** moov ****************************/

pub const TYPE_MOOV: BoxType = *b"moov";

pub struct Moov {}

impl ImmutableBox for Moov {
    fn box_type(&self) -> BoxType {
        TYPE_MOOV
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

/*************************** traf ****************************/

pub const TYPE_TRAF: BoxType = *b"traf";

pub struct Traf {}

impl ImmutableBox for Traf {
    fn box_type(&self) -> BoxType {
        TYPE_TRAF
    }

    fn size(&self) -> usize {
        0
    }

    fn marshal(&self, _: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        Ok(())
    }
}

/*************************** tfdt ****************************/

pub const TYPE_TFDT: BoxType = *b"tfdt";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Tfdt {
    pub full_box: FullBox,
    pub base_media_decode_time_v0: u32,
    pub base_media_decode_time_v1: u64,
}

impl Tfdt {
    // Unmarshal from the FullBox version byte onwards.
    pub fn unmarshal(b: &[u8]) -> Result<Self, UnmarshalError> {
        let mut r = Reader::new(b);
        let full_box = FullBox::unmarshal_field(&mut r)?;
        let mut tfdt = Tfdt {
            full_box,
            ..Tfdt::default()
        };
        if tfdt.full_box.version == 0 {
            tfdt.base_media_decode_time_v0 = r.read_u32()?;
        } else {
            tfdt.base_media_decode_time_v1 = r.read_u64()?;
        }
        Ok(tfdt)
    }
}

impl ImmutableBox for Tfdt {
    fn box_type(&self) -> BoxType {
        TYPE_TFDT
    }

    fn size(&self) -> usize {
        if self.full_box.version == 0 {
            8
        } else {
            12
        }
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        if self.full_box.version == 0 {
            w.write_all(&self.base_media_decode_time_v0.to_be_bytes())?;
        } else {
            w.write_all(&self.base_media_decode_time_v1.to_be_bytes())?;
        }
        Ok(())
    }
}

/*************************** tfhd ****************************/

pub const TYPE_TFHD: BoxType = *b"tfhd";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Tfhd {
    pub full_box: FullBox,
    pub track_id: u32,

    // optional
    pub base_data_offset: u64,
    pub sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

pub const TFHD_BASE_DATA_OFFSET_PRESENT: u32 = 0x0000_0001;
pub const TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT: u32 = 0x0000_0002;
pub const TFHD_DEFAULT_SAMPLE_DURATION_PRESENT: u32 = 0x0000_0008;
pub const TFHD_DEFAULT_SAMPLE_SIZE_PRESENT: u32 = 0x0000_0010;
pub const TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_0020;
pub const TFHD_DURATION_IS_EMPTY: u32 = 0x0001_0000;
pub const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x0002_0000;

impl Tfhd {
    // Unmarshal from the FullBox version byte onwards.
    pub fn unmarshal(b: &[u8]) -> Result<Self, UnmarshalError> {
        let mut r = Reader::new(b);
        let full_box = FullBox::unmarshal_field(&mut r)?;
        let track_id = r.read_u32()?;
        let mut tfhd = Tfhd {
            full_box,
            track_id,
            ..Tfhd::default()
        };
        if tfhd.full_box.check_flag(TFHD_BASE_DATA_OFFSET_PRESENT) {
            tfhd.base_data_offset = r.read_u64()?;
        }
        if tfhd
            .full_box
            .check_flag(TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT)
        {
            tfhd.sample_description_index = r.read_u32()?;
        }
        if tfhd
            .full_box
            .check_flag(TFHD_DEFAULT_SAMPLE_DURATION_PRESENT)
        {
            tfhd.default_sample_duration = r.read_u32()?;
        }
        if tfhd.full_box.check_flag(TFHD_DEFAULT_SAMPLE_SIZE_PRESENT) {
            tfhd.default_sample_size = r.read_u32()?;
        }
        if tfhd.full_box.check_flag(TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT) {
            tfhd.default_sample_flags = r.read_u32()?;
        }
        Ok(tfhd)
    }
}

impl ImmutableBox for Tfhd {
    fn box_type(&self) -> BoxType {
        TYPE_TFHD
    }

    fn size(&self) -> usize {
        let mut total: usize = self.full_box.field_size() + 4;
        if self.full_box.check_flag(TFHD_BASE_DATA_OFFSET_PRESENT) {
            total += 8;
        }
        if self
            .full_box
            .check_flag(TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT)
        {
            total += 4;
        }
        if self
            .full_box
            .check_flag(TFHD_DEFAULT_SAMPLE_DURATION_PRESENT)
        {
            total += 4;
        }
        if self.full_box.check_flag(TFHD_DEFAULT_SAMPLE_SIZE_PRESENT) {
            total += 4;
        }
        if self.full_box.check_flag(TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT) {
            total += 4;
        }
        total
    }

    // Marshal box to writer.
    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.track_id.to_be_bytes())?;
        if self.full_box.check_flag(TFHD_BASE_DATA_OFFSET_PRESENT) {
            w.write_all(&self.base_data_offset.to_be_bytes())?;
        }
        if self
            .full_box
            .check_flag(TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT)
        {
            w.write_all(&self.sample_description_index.to_be_bytes())?;
        }
        if self
            .full_box
            .check_flag(TFHD_DEFAULT_SAMPLE_DURATION_PRESENT)
        {
            w.write_all(&self.default_sample_duration.to_be_bytes())?;
        }
        if self.full_box.check_flag(TFHD_DEFAULT_SAMPLE_SIZE_PRESENT) {
            w.write_all(&self.default_sample_size.to_be_bytes())?;
        }
        if self.full_box.check_flag(TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT) {
            w.write_all(&self.default_sample_flags.to_be_bytes())?;
        }
        Ok(())
    }
}

/*************************** trun ****************************/

pub const TYPE_TRUN: BoxType = *b"trun";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TrunEntry {
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: u32,
    pub sample_composition_time_offset_v0: u32,
    pub sample_composition_time_offset_v1: i32,
}

pub const TRUN_DATA_OFFSET_PRESENT: u32 = 0b0000_0000_0001;
pub const TRUN_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0b0000_0000_0100;
pub const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0b0001_0000_0000;
pub const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0b0010_0000_0000;
pub const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0b0100_0000_0000;
pub const TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT: u32 = 0b1000_0000_0000;

impl TrunEntry {
    fn field_size(full_box: &FullBox) -> usize {
        let mut total = 0;
        if full_box.check_flag(TRUN_SAMPLE_DURATION_PRESENT) {
            total += 4;
        }
        if full_box.check_flag(TRUN_SAMPLE_SIZE_PRESENT) {
            total += 4;
        }
        if full_box.check_flag(TRUN_SAMPLE_FLAGS_PRESENT) {
            total += 4;
        }
        if full_box.check_flag(TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT) {
            total += 4;
        }
        total
    }

    fn marshal_field(
        &self,
        w: &mut dyn std::io::Write,
        full_box: &FullBox,
    ) -> Result<(), Mp4Error> {
        if full_box.check_flag(TRUN_SAMPLE_DURATION_PRESENT) {
            w.write_all(&self.sample_duration.to_be_bytes())?;
        }
        if full_box.check_flag(TRUN_SAMPLE_SIZE_PRESENT) {
            w.write_all(&self.sample_size.to_be_bytes())?;
        }
        if full_box.check_flag(TRUN_SAMPLE_FLAGS_PRESENT) {
            w.write_all(&self.sample_flags.to_be_bytes())?;
        }
        if full_box.check_flag(TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT) {
            if full_box.version == 0 {
                w.write_all(&self.sample_composition_time_offset_v0.to_be_bytes())?;
            } else {
                w.write_all(&self.sample_composition_time_offset_v1.to_be_bytes())?;
            }
        }
        Ok(())
    }

    fn unmarshal_field(r: &mut Reader, full_box: &FullBox) -> Result<Self, UnmarshalError> {
        let mut entry = TrunEntry::default();
        if full_box.check_flag(TRUN_SAMPLE_DURATION_PRESENT) {
            entry.sample_duration = r.read_u32()?;
        }
        if full_box.check_flag(TRUN_SAMPLE_SIZE_PRESENT) {
            entry.sample_size = r.read_u32()?;
        }
        if full_box.check_flag(TRUN_SAMPLE_FLAGS_PRESENT) {
            entry.sample_flags = r.read_u32()?;
        }
        if full_box.check_flag(TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT) {
            if full_box.version == 0 {
                entry.sample_composition_time_offset_v0 = r.read_u32()?;
            } else {
                entry.sample_composition_time_offset_v1 = r.read_i32()?;
            }
        }
        Ok(entry)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Trun {
    pub full_box: FullBox,
    pub sample_count: u32,

    // optional fields
    pub data_offset: i32,
    pub first_sample_flags: u32,
    pub entries: Vec<TrunEntry>,
}

impl Trun {
    // Unmarshal from the FullBox version byte onwards. The
    // per-sample table is only materialized when at least one
    // per-sample field is present.
    pub fn unmarshal(b: &[u8]) -> Result<Self, UnmarshalError> {
        let mut r = Reader::new(b);
        let full_box = FullBox::unmarshal_field(&mut r)?;
        let sample_count = r.read_u32()?;
        let mut trun = Trun {
            full_box,
            sample_count,
            ..Trun::default()
        };
        if trun.full_box.check_flag(TRUN_DATA_OFFSET_PRESENT) {
            trun.data_offset = r.read_i32()?;
        }
        if trun.full_box.check_flag(TRUN_FIRST_SAMPLE_FLAGS_PRESENT) {
            trun.first_sample_flags = r.read_u32()?;
        }
        if TrunEntry::field_size(&trun.full_box) != 0 {
            for _ in 0..sample_count {
                trun.entries
                    .push(TrunEntry::unmarshal_field(&mut r, &trun.full_box)?);
            }
        }
        Ok(trun)
    }
}

impl ImmutableBox for Trun {
    fn box_type(&self) -> BoxType {
        TYPE_TRUN
    }

    fn size(&self) -> usize {
        let mut total = 8;
        if self.full_box.check_flag(TRUN_DATA_OFFSET_PRESENT) {
            total += 4;
        }
        if self.full_box.check_flag(TRUN_FIRST_SAMPLE_FLAGS_PRESENT) {
            total += 4;
        }
        total += self.entries.len() * TrunEntry::field_size(&self.full_box);
        total
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.sample_count.to_be_bytes())?;
        if self.full_box.check_flag(TRUN_DATA_OFFSET_PRESENT) {
            w.write_all(&self.data_offset.to_be_bytes())?;
        }
        if self.full_box.check_flag(TRUN_FIRST_SAMPLE_FLAGS_PRESENT) {
            w.write_all(&self.first_sample_flags.to_be_bytes())?;
        }
        for entry in &self.entries {
            entry.marshal_field(w, &self.full_box)?;
        }
        Ok(())
    }
}

/************************ patch_moof ************************/

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchMoofError {
    #[error("find box: {0}")]
    FindBox(#[from] FindBoxError),

    #[error("unmarshal: {0}")]
    Unmarshal(#[from] UnmarshalError),
}

// Rewrites the tfdt baseMediaDecodeTime of a single fragment in
// place and returns the fragment duration in track timescale
// units, or `None` if the moof carries neither per-sample
// durations nor a default sample duration.
//
// The written value is the caller-supplied baseline, accumulated
// BEFORE this fragment's duration is known. The caller adds the
// returned duration to the baseline for the next fragment.
pub fn patch_moof(
    moof: &mut [u8],
    base_media_decode_time: u64,
) -> Result<Option<u64>, PatchMoofError> {
    let tfhd_pos = find_box(moof, TYPE_TFHD)?;
    let tfdt_pos = find_box(moof, TYPE_TFDT)?;
    let trun_pos = find_box(moof, TYPE_TRUN)?;

    let tfhd_header = BoxHeader::unmarshal(&moof[tfhd_pos..])?;
    let tfdt_header = BoxHeader::unmarshal(&moof[tfdt_pos..])?;
    let trun_header = BoxHeader::unmarshal(&moof[trun_pos..])?;

    let tfhd = Tfhd::unmarshal(&moof[tfhd_pos + tfhd_header.header_size..])?;
    let tfdt = Tfdt::unmarshal(&moof[tfdt_pos + tfdt_header.header_size..])?;
    let trun = Trun::unmarshal(&moof[trun_pos + trun_header.header_size..])?;

    let duration = if trun.full_box.check_flag(TRUN_SAMPLE_DURATION_PRESENT) {
        Some(
            trun.entries
                .iter()
                .map(|e| u64::from(e.sample_duration))
                .sum(),
        )
    } else if tfhd
        .full_box
        .check_flag(TFHD_DEFAULT_SAMPLE_DURATION_PRESENT)
    {
        Some(u64::from(trun.sample_count) * u64::from(tfhd.default_sample_duration))
    } else {
        None
    };

    // FullBox version and flags sit between the header and the
    // decode time, hence the extra 4 bytes.
    let write_pos = tfdt_pos + tfdt_header.header_size + 4;
    if tfdt.full_box.version == 0 {
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let v = base_media_decode_time as u32;
        moof[write_pos..write_pos + 4].copy_from_slice(&v.to_be_bytes());
    } else {
        moof[write_pos..write_pos + 8].copy_from_slice(&base_media_decode_time.to_be_bytes());
    }

    Ok(duration)
}
