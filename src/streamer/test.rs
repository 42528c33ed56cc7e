// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::unwrap_used)]

use crate::*;
use bytes::Bytes;
use common::{ArcLogger, DummyLogger, ILogger, LogEntry, LogLevel};
use mp4::{
    find_box, u32_to_flags, write_single_box, Boxes, CompatibleBrandElem, Ftyp, FullBox, Mdat,
    Mfhd, Moof, Moov, Tfdt, Tfhd, Traf, Trun, TrunEntry, TFHD_DEFAULT_BASE_IS_MOOF,
    TRUN_DATA_OFFSET_PRESENT, TRUN_SAMPLE_DURATION_PRESENT, TRUN_SAMPLE_SIZE_PRESENT, TYPE_TFDT,
};
use pretty_assertions::assert_eq;
use pretty_hex::pretty_hex;
use std::{
    cell::RefCell,
    rc::Rc,
    sync::{Arc, Mutex},
};
use test_case::test_case;

#[derive(Clone, Default)]
struct TestSink(Rc<RefCell<Vec<Bytes>>>);

impl TestSink {
    fn new() -> Self {
        Self::default()
    }

    fn boxes(&self) -> Vec<Bytes> {
        self.0.borrow().clone()
    }
}

impl Sink for TestSink {
    fn send(&mut self, b: Bytes) {
        self.0.borrow_mut().push(b);
    }
}

#[derive(Default)]
struct TestLogger(Mutex<Vec<LogEntry>>);

impl ILogger for TestLogger {
    fn log(&self, entry: LogEntry) {
        self.0.lock().unwrap().push(entry);
    }
}

fn build_ftyp() -> Vec<u8> {
    let mut buf = Vec::new();
    write_single_box(
        &mut buf,
        &Ftyp {
            major_brand: *b"iso5",
            minor_version: 512,
            compatible_brands: vec![
                CompatibleBrandElem(*b"iso5"),
                CompatibleBrandElem(*b"iso6"),
                CompatibleBrandElem(*b"mp41"),
            ],
        },
    )
    .unwrap();
    buf
}

fn build_moov() -> Vec<u8> {
    let mut buf = Vec::new();
    Boxes {
        mp4_box: Box::new(Moov {}),
        children: vec![],
    }
    .marshal(&mut buf)
    .unwrap();
    buf
}

fn build_moof(trun: Trun) -> Boxes {
    Boxes {
        mp4_box: Box::new(Moof {}),
        children: vec![
            Boxes {
                mp4_box: Box::new(Mfhd {
                    full_box: FullBox::default(),
                    sequence_number: 1,
                }),
                children: vec![],
            },
            Boxes {
                mp4_box: Box::new(Traf {}),
                children: vec![
                    Boxes {
                        mp4_box: Box::new(Tfhd {
                            full_box: FullBox {
                                version: 0,
                                flags: u32_to_flags(TFHD_DEFAULT_BASE_IS_MOOF),
                            },
                            track_id: 1,
                            ..Tfhd::default()
                        }),
                        children: vec![],
                    },
                    Boxes {
                        mp4_box: Box::new(Tfdt {
                            full_box: FullBox {
                                version: 1,
                                flags: [0, 0, 0],
                            },
                            base_media_decode_time_v0: 0,
                            // The producer's own timeline, which
                            // must never reach a viewer.
                            base_media_decode_time_v1: 90000,
                        }),
                        children: vec![],
                    },
                    Boxes {
                        mp4_box: Box::new(trun),
                        children: vec![],
                    },
                ],
            },
        ],
    }
}

// Returns a moof+mdat pair with one trun entry per duration.
fn build_fragment(durations: &[u32], payload: &[u8]) -> Vec<u8> {
    let trun = Trun {
        full_box: FullBox {
            version: 0,
            flags: u32_to_flags(
                TRUN_DATA_OFFSET_PRESENT
                    | TRUN_SAMPLE_DURATION_PRESENT
                    | TRUN_SAMPLE_SIZE_PRESENT,
            ),
        },
        sample_count: u32::try_from(durations.len()).unwrap(),
        data_offset: 0x70,
        first_sample_flags: 0,
        entries: durations
            .iter()
            .map(|d| TrunEntry {
                sample_duration: *d,
                sample_size: 4,
                ..TrunEntry::default()
            })
            .collect(),
    };

    let mut buf = Vec::new();
    build_moof(trun).marshal(&mut buf).unwrap();
    write_single_box(&mut buf, &Mdat(payload.to_vec())).unwrap();
    buf
}

// Neither per-sample durations nor a tfhd default.
fn build_fragment_without_durations(payload: &[u8]) -> Vec<u8> {
    let trun = Trun {
        sample_count: 2,
        ..Trun::default()
    };
    let mut buf = Vec::new();
    build_moof(trun).marshal(&mut buf).unwrap();
    write_single_box(&mut buf, &Mdat(payload.to_vec())).unwrap();
    buf
}

fn read_tfdt(moof: &[u8]) -> u64 {
    let pos = find_box(moof, TYPE_TFDT).unwrap();
    let header = mp4::BoxHeader::unmarshal(&moof[pos..]).unwrap();
    let tfdt = Tfdt::unmarshal(&moof[pos + header.header_size..]).unwrap();
    if tfdt.full_box.version == 0 {
        tfdt.base_media_decode_time_v0.into()
    } else {
        tfdt.base_media_decode_time_v1
    }
}

#[test]
fn test_viewer_registered_before_stream() {
    let mut stream = Mp4Stream::new(DummyLogger::new());
    let sink = TestSink::new();
    stream.add_viewer(Box::new(sink.clone()));
    assert_eq!(1, stream.num_viewers());

    let ftyp = build_ftyp();
    assert_eq!(28, ftyp.len());
    let moov = build_moov();

    stream.feed(&ftyp).unwrap();
    stream.feed(&moov).unwrap();
    stream.feed(&build_fragment(&[1000, 1000], b"abcd")).unwrap();

    let got = sink.boxes();
    assert_eq!(4, got.len());
    assert_eq!(pretty_hex(&ftyp), pretty_hex(&got[0]));
    assert_eq!(pretty_hex(&moov), pretty_hex(&got[1]));
    assert_eq!(0, read_tfdt(&got[2]));
    assert_eq!(b"mdat", &got[3][4..8]);
    assert_eq!(b"abcd", &got[3][8..]);
}

#[test]
fn test_baseline_advances_by_fragment_duration() {
    let mut stream = Mp4Stream::new(DummyLogger::new());
    let sink = TestSink::new();
    stream.add_viewer(Box::new(sink.clone()));

    stream.feed(&build_ftyp()).unwrap();
    stream.feed(&build_moov()).unwrap();
    stream.feed(&build_fragment(&[1000, 1000], b"abcd")).unwrap();
    stream.feed(&build_fragment(&[500], b"efgh")).unwrap();
    stream.feed(&build_fragment(&[250], b"ijkl")).unwrap();

    let got = sink.boxes();
    assert_eq!(8, got.len());
    assert_eq!(0, read_tfdt(&got[2]));
    assert_eq!(2000, read_tfdt(&got[4]));
    assert_eq!(2500, read_tfdt(&got[6]));
}

#[test]
fn test_late_viewer_starts_at_zero() {
    let mut stream = Mp4Stream::new(DummyLogger::new());
    let first = TestSink::new();
    stream.add_viewer(Box::new(first.clone()));

    let ftyp = build_ftyp();
    let moov = build_moov();
    stream.feed(&ftyp).unwrap();
    stream.feed(&moov).unwrap();
    stream.feed(&build_fragment(&[1000, 1000], b"abcd")).unwrap();

    // Cached init boxes are replayed synchronously inside the
    // registration call.
    let late = TestSink::new();
    stream.add_viewer(Box::new(late.clone()));
    let got = late.boxes();
    assert_eq!(2, got.len());
    assert_eq!(pretty_hex(&ftyp), pretty_hex(&got[0]));
    assert_eq!(pretty_hex(&moov), pretty_hex(&got[1]));

    stream.feed(&build_fragment(&[500], b"efgh")).unwrap();

    // Same fragment, independent timelines.
    assert_eq!(2000, read_tfdt(&first.boxes()[4]));
    assert_eq!(0, read_tfdt(&late.boxes()[2]));

    // The mdat is identical for both.
    assert_eq!(
        pretty_hex(&first.boxes()[5]),
        pretty_hex(&late.boxes()[3])
    );
}

#[test_case(1; "single bytes")]
#[test_case(3; "three byte chunks")]
#[test_case(17; "seventeen byte chunks")]
fn test_feed_chunked(chunk_size: usize) {
    let mut data = Vec::new();
    data.extend_from_slice(&build_ftyp());
    data.extend_from_slice(&build_moov());
    data.extend_from_slice(&build_fragment(&[1000], b"abcd"));
    data.extend_from_slice(&build_fragment(&[500], b"efgh"));

    let mut stream = Mp4Stream::new(DummyLogger::new());
    let sink = TestSink::new();
    stream.add_viewer(Box::new(sink.clone()));

    for chunk in data.chunks(chunk_size) {
        stream.feed(chunk).unwrap();
    }

    let got = sink.boxes();
    assert_eq!(6, got.len());
    assert_eq!(0, read_tfdt(&got[2]));
    assert_eq!(1000, read_tfdt(&got[4]));
}

#[test]
fn test_remove_viewer() {
    let mut stream = Mp4Stream::new(DummyLogger::new());
    let sink = TestSink::new();
    let id = stream.add_viewer(Box::new(sink.clone()));

    assert!(!stream.remove_viewer(ViewerId(99)));
    assert!(stream.remove_viewer(id));
    assert!(!stream.remove_viewer(id));
    assert_eq!(0, stream.num_viewers());

    stream.feed(&build_ftyp()).unwrap();
    stream.feed(&build_moov()).unwrap();
    stream.feed(&build_fragment(&[1000], b"abcd")).unwrap();
    assert!(sink.boxes().is_empty());
}

#[test]
fn test_fragment_before_init() {
    let mut stream = Mp4Stream::new(DummyLogger::new());
    let sink = TestSink::new();
    stream.add_viewer(Box::new(sink.clone()));

    let err = stream
        .feed(&build_fragment(&[1000], b"abcd"))
        .unwrap_err();
    assert!(matches!(err, FeedError::InitNotCached));
    assert!(sink.boxes().is_empty());

    // The stream recovers once the init boxes arrive.
    stream.feed(&build_ftyp()).unwrap();
    stream.feed(&build_moov()).unwrap();
    stream.feed(&build_fragment(&[1000], b"efgh")).unwrap();
    assert_eq!(4, sink.boxes().len());
}

#[test]
fn test_malformed_fragment_is_fatal_for_itself() {
    let mut stream = Mp4Stream::new(DummyLogger::new());
    let sink = TestSink::new();
    stream.add_viewer(Box::new(sink.clone()));

    stream.feed(&build_ftyp()).unwrap();
    stream.feed(&build_moov()).unwrap();

    // A moof without a trun cannot be patched.
    let mut bad = Vec::new();
    Boxes {
        mp4_box: Box::new(Moof {}),
        children: vec![Boxes {
            mp4_box: Box::new(Traf {}),
            children: vec![
                Boxes {
                    mp4_box: Box::new(Tfhd {
                        full_box: FullBox {
                            version: 0,
                            flags: u32_to_flags(TFHD_DEFAULT_BASE_IS_MOOF),
                        },
                        track_id: 1,
                        ..Tfhd::default()
                    }),
                    children: vec![],
                },
                Boxes {
                    mp4_box: Box::new(Tfdt {
                        full_box: FullBox {
                            version: 1,
                            flags: [0, 0, 0],
                        },
                        base_media_decode_time_v0: 0,
                        base_media_decode_time_v1: 0,
                    }),
                    children: vec![],
                },
            ],
        }],
    }
    .marshal(&mut bad)
    .unwrap();
    write_single_box(&mut bad, &Mdat(b"abcd".to_vec())).unwrap();

    let err = stream.feed(&bad).unwrap_err();
    assert!(matches!(err, FeedError::PatchMoof(_)));
    assert_eq!(2, sink.boxes().len());

    // The pair was dropped, the next fragment still goes through.
    stream.feed(&build_fragment(&[1000], b"efgh")).unwrap();
    assert_eq!(4, sink.boxes().len());
}

#[test]
fn test_unexpected_root_box_is_discarded() {
    let logger = Arc::new(TestLogger::default());
    let arc_logger: ArcLogger = logger.clone();
    let mut stream = Mp4Stream::new(arc_logger);
    let sink = TestSink::new();
    stream.add_viewer(Box::new(sink.clone()));

    stream.feed(&build_ftyp()).unwrap();
    stream.feed(&build_moov()).unwrap();

    let free = [
        0, 0, 0, 0x10, b'f', b'r', b'e', b'e', //
        1, 2, 3, 4, 5, 6, 7, 8, //
    ];
    stream.feed(&free).unwrap();

    let entries = logger.0.lock().unwrap();
    assert_eq!(1, entries.len());
    assert!(entries[0].message.contains("free"));
    drop(entries);

    // Parsing continues after the discarded box.
    stream.feed(&build_fragment(&[1000], b"abcd")).unwrap();
    assert_eq!(4, sink.boxes().len());
}

#[test]
fn test_undeterminable_duration_stalls_baseline() {
    let logger = Arc::new(TestLogger::default());
    let arc_logger: ArcLogger = logger.clone();
    let mut stream = Mp4Stream::new(arc_logger);
    let sink = TestSink::new();
    stream.add_viewer(Box::new(sink.clone()));

    stream.feed(&build_ftyp()).unwrap();
    stream.feed(&build_moov()).unwrap();
    stream
        .feed(&build_fragment_without_durations(b"abcd"))
        .unwrap();
    stream
        .feed(&build_fragment_without_durations(b"efgh"))
        .unwrap();

    let got = sink.boxes();
    assert_eq!(6, got.len());
    assert_eq!(0, read_tfdt(&got[2]));
    // The duration fell back to zero, so the baseline never moved.
    assert_eq!(0, read_tfdt(&got[4]));

    let entries = logger.0.lock().unwrap();
    assert_eq!(2, entries.len());
    assert_eq!(LogLevel::Warning, entries[0].level);
}

#[test]
fn test_boundary_detector_normal_and_extended() {
    let mut detector = BoundaryDetector::new();

    let mut data = vec![
        0, 0, 0, 0x10, b'f', b'r', b'e', b'e', //
        1, 2, 3, 4, 5, 6, 7, 8, //
    ];
    let free_len = data.len();
    data.extend_from_slice(&[
        0, 0, 0, 1, // extended size marker
        0, 0, 0, 0, 0, 0, 0, 0x18, // size
        b'm', b'd', b'a', b't', //
        b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', //
    ]);

    let mut completed = Vec::new();
    for (i, byte) in data.iter().enumerate() {
        if let Some((box_type, buf)) = detector.push(*byte) {
            completed.push((i, box_type, buf));
        }
    }

    // Each box completes exactly on its last byte with exactly
    // the declared number of bytes.
    assert_eq!(2, completed.len());
    assert_eq!((free_len - 1, *b"free"), (completed[0].0, completed[0].1));
    assert_eq!(&data[..free_len], completed[0].2.as_slice());
    assert_eq!((data.len() - 1, *b"mdat"), (completed[1].0, completed[1].1));
    assert_eq!(&data[free_len..], completed[1].2.as_slice());
}

#[test]
fn test_boundary_detector_absorbs_leading_bytes() {
    // Garbage that cannot form a valid header keeps accumulating
    // until a recognizable root box completes.
    let mut detector = BoundaryDetector::new();
    for byte in [0xde, 0xad] {
        assert!(detector.push(byte).is_none());
    }
}
