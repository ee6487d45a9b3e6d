//! Progressive MP4 demuxer tests against hand-built files.

mod common;

use bytes::Bytes;
use common::Mp4Builder;
use frameserve::{DemuxEvent, EncodedSample, FrameServeError, Mp4Demuxer, MovieInfo, TrackKind};

/// Feed `file` at once and poll until the demuxer fails.
fn first_error(file: &[u8]) -> FrameServeError {
    let mut demuxer = Mp4Demuxer::new();
    demuxer.append(Bytes::copy_from_slice(file), 0).unwrap();
    demuxer.flush();
    loop {
        match demuxer.poll() {
            Ok(Some(DemuxEvent::Ready(movie))) => {
                demuxer.set_extraction_track(movie.tracks[0].id).unwrap();
            }
            Ok(Some(DemuxEvent::Sample(_))) => {}
            Ok(None) => panic!("demuxer finished without an error"),
            Err(error) => return error,
        }
    }
}

fn be32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_be_bytes()).collect()
}

/// Feed `file` in `chunk_size` pieces, selecting the first track on
/// readiness, and collect everything the demuxer reports.
fn demux_all(file: &[u8], chunk_size: usize) -> (MovieInfo, Vec<EncodedSample>) {
    let mut demuxer = Mp4Demuxer::new();
    let mut movie = None;
    let mut samples = Vec::new();

    let mut drain = |demuxer: &mut Mp4Demuxer, movie: &mut Option<MovieInfo>| {
        while let Some(event) = demuxer.poll().expect("poll") {
            match event {
                DemuxEvent::Ready(info) => {
                    assert!(movie.is_none(), "readiness reported twice");
                    demuxer
                        .set_extraction_track(info.tracks[0].id)
                        .expect("select track");
                    *movie = Some(info);
                }
                DemuxEvent::Sample(sample) => samples.push(sample),
            }
        }
    };

    let mut offset = 0u64;
    for chunk in file.chunks(chunk_size) {
        demuxer
            .append(Bytes::copy_from_slice(chunk), offset)
            .expect("append");
        offset += chunk.len() as u64;
        drain(&mut demuxer, &mut movie);
    }
    demuxer.flush();
    drain(&mut demuxer, &mut movie);

    (movie.expect("movie"), samples)
}

// ── Readiness ────────────────────────────────────────────────────

#[test]
fn reports_track_metadata() {
    let builder = Mp4Builder::new(10);
    let (movie, _) = demux_all(&builder.build(), 4096);

    assert_eq!(movie.time_base, 3000);
    assert_eq!(movie.tracks.len(), 1);
    let track = &movie.tracks[0];
    assert_eq!(track.id, 1);
    assert_eq!(track.kind, TrackKind::Video);
    assert_eq!(track.codec, "avc1");
    assert_eq!((track.width, track.height), (64, 48));
    assert_eq!(track.time_base, 3000);
    assert_eq!(track.duration, 1000);
    assert_eq!(track.sample_count, 10);
    let config = track.decoder_config.as_deref().expect("avcC record");
    assert_eq!(&config[..4], &common::AVC_CONFIG[..4]);
    assert!(track.is_usable_video());
    assert!(movie.video_track().is_some());
}

#[test]
fn audio_only_movie_has_no_video_track() {
    let mut builder = Mp4Builder::new(3);
    builder.handler = *b"soun";
    builder.codec = *b"alaw";
    let (movie, _) = demux_all(&builder.build(), 4096);

    assert_eq!(movie.tracks[0].kind, TrackKind::Audio);
    assert_eq!(movie.tracks[0].codec, "alaw");
    assert!(movie.video_track().is_none());
}

// ── Sample delivery ──────────────────────────────────────────────

#[test]
fn delivers_samples_in_order_with_timestamps() {
    let builder = Mp4Builder::new(12);
    let (_, samples) = demux_all(&builder.build(), 4096);

    assert_eq!(samples.len(), 12);
    for (index, sample) in samples.iter().enumerate() {
        assert_eq!(sample.track_id, 1);
        assert_eq!(sample.timestamp, index as i64 * 100);
        assert_eq!(sample.decode_timestamp, sample.timestamp);
        assert_eq!(sample.time_base, 3000);
        assert_eq!(&sample.data[..], &builder.samples[index][..]);
    }
    assert!(samples[0].is_sync);
    assert!(!samples[1].is_sync);
}

#[test]
fn tiny_chunks_give_the_same_result() {
    let builder = Mp4Builder::new(20);
    let file = builder.build();
    let (_, whole) = demux_all(&file, file.len());
    let (_, trickled) = demux_all(&file, 7);

    assert_eq!(whole.len(), trickled.len());
    for (a, b) in whole.iter().zip(&trickled) {
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.data, b.data);
    }
}

#[test]
fn composition_offsets_shift_timestamps() {
    let mut builder = Mp4Builder::new(4);
    builder.composition_offsets = Some(vec![200, 500, 0, 100]);
    let (_, samples) = demux_all(&builder.build(), 4096);

    let timestamps: Vec<i64> = samples.iter().map(|sample| sample.timestamp).collect();
    assert_eq!(timestamps, vec![200, 600, 200, 400]);
    assert_eq!(samples[1].decode_timestamp, 100);
}

#[test]
fn moov_after_mdat_is_still_demuxed() {
    let builder = Mp4Builder::new(8).moov_at_end();
    let (movie, samples) = demux_all(&builder.build(), 13);

    assert_eq!(movie.tracks[0].sample_count, 8);
    assert_eq!(samples.len(), 8);
    assert_eq!(&samples[7].data[..], &builder.samples[7][..]);
}

#[test]
fn nothing_is_delivered_without_a_selection() {
    let file = Mp4Builder::new(5).build();
    let mut demuxer = Mp4Demuxer::new();
    demuxer.append(Bytes::from(file), 0).unwrap();
    demuxer.flush();

    assert!(matches!(demuxer.poll().unwrap(), Some(DemuxEvent::Ready(_))));
    assert!(demuxer.poll().unwrap().is_none());
}

// ── Memory ───────────────────────────────────────────────────────

#[test]
fn consumed_bytes_are_released() {
    let file = Mp4Builder::new(30).build();
    let mut demuxer = Mp4Demuxer::new();
    let mut largest = 0;
    let mut delivered = 0;

    let mut offset = 0u64;
    for chunk in file.chunks(64) {
        demuxer
            .append(Bytes::copy_from_slice(chunk), offset)
            .unwrap();
        offset += chunk.len() as u64;
        while let Some(event) = demuxer.poll().unwrap() {
            match event {
                DemuxEvent::Ready(movie) => demuxer.set_extraction_track(movie.tracks[0].id).unwrap(),
                DemuxEvent::Sample(_) => delivered += 1,
            }
            largest = largest.max(demuxer.buffered_len());
        }
        largest = largest.max(demuxer.buffered_len());
    }

    assert_eq!(delivered, 30);
    assert_eq!(demuxer.buffered_len(), 0);
    assert_eq!(demuxer.bytes_received(), file.len() as u64);
    assert!(largest < file.len(), "buffer held {largest} of {} bytes", file.len());
}

// ── Errors and truncation ────────────────────────────────────────

#[test]
fn flush_without_moov_is_an_error() {
    let mut demuxer = Mp4Demuxer::new();
    demuxer
        .append(Bytes::from_static(b"\0\0\0\x10ftypisom\0\0\0\0"), 0)
        .unwrap();
    assert!(demuxer.poll().unwrap().is_none());

    demuxer.flush();
    let error = demuxer.poll().unwrap_err();
    assert!(matches!(error, FrameServeError::Demux(_)));
    assert!(error.to_string().contains("moov"));
}

#[test]
fn non_contiguous_append_is_rejected() {
    let mut demuxer = Mp4Demuxer::new();
    demuxer.append(Bytes::from_static(&[0; 16]), 0).unwrap();
    let result = demuxer.append(Bytes::from_static(&[0; 16]), 20);
    assert!(matches!(result, Err(FrameServeError::Demux(_))));
}

#[test]
fn box_smaller_than_header_is_rejected() {
    let mut demuxer = Mp4Demuxer::new();
    demuxer
        .append(Bytes::from_static(b"\0\0\0\x04ftyp"), 0)
        .unwrap();
    assert!(matches!(demuxer.poll(), Err(FrameServeError::Demux(_))));
}

#[test]
fn truncated_input_stops_before_the_partial_sample() {
    let builder = Mp4Builder::new(6);
    let mut file = builder.build();
    file.truncate(file.len() - 3);

    let (_, samples) = demux_all(&file, 4096);
    assert_eq!(samples.len(), 5);
}

#[test]
fn truncated_moov_is_an_error() {
    let file = Mp4Builder::new(6).build();
    let mut demuxer = Mp4Demuxer::new();
    demuxer
        .append(Bytes::copy_from_slice(&file[..file.len() / 2]), 0)
        .unwrap();
    demuxer.flush();
    assert!(demuxer.poll().is_err());
}

// ── Hostile size fields ──────────────────────────────────────────

#[test]
fn largesize_past_the_end_of_the_address_space_is_rejected() {
    let mut file = b"\0\0\0\x08ftyp".to_vec();
    file.extend_from_slice(b"\0\0\0\x01free");
    file.extend_from_slice(&u64::MAX.to_be_bytes());

    let mut demuxer = Mp4Demuxer::new();
    demuxer.append(Bytes::from(file), 0).unwrap();
    assert!(matches!(demuxer.poll(), Err(FrameServeError::Demux(_))));
}

#[test]
fn largesize_smaller_than_its_header_is_rejected() {
    let mut file = b"\0\0\0\x01free".to_vec();
    file.extend_from_slice(&8u64.to_be_bytes());

    let mut demuxer = Mp4Demuxer::new();
    demuxer.append(Bytes::from(file), 0).unwrap();
    assert!(matches!(demuxer.poll(), Err(FrameServeError::Demux(_))));
}

#[test]
fn oversized_moov_is_rejected_before_buffering() {
    let mut demuxer = Mp4Demuxer::new();
    demuxer
        .append(Bytes::from_static(b"\xff\xff\xff\xffmoov"), 0)
        .unwrap();
    let error = demuxer.poll().unwrap_err();
    assert!(error.to_string().contains("limit"));
}

#[test]
fn co64_offset_near_the_end_of_the_address_space_is_rejected() {
    let file = Mp4Builder::new(3).with_co64(u64::MAX - 8).build();
    let error = first_error(&file);
    assert!(matches!(error, FrameServeError::Demux(_)));
    assert!(error.to_string().contains("overflows"));
}

#[test]
fn co64_offsets_are_honoured() {
    let builder = Mp4Builder::new(4).with_co64(0);
    let (_, samples) = demux_all(&builder.build(), 4096);
    assert_eq!(samples.len(), 4);
    assert_eq!(&samples[3].data[..], &builder.samples[3][..]);
}

#[test]
fn huge_table_entry_counts_are_errors_not_allocations() {
    for kind in [b"stsc", b"stts", b"ctts", b"stss", b"stco"] {
        let mut builder = Mp4Builder::new(3).with_table(kind, be32(&[u32::MAX]));
        builder.composition_offsets = Some(vec![0, 0, 0]);
        let error = first_error(&builder.build());
        assert!(
            matches!(error, FrameServeError::Demux(_)),
            "{}: {error}",
            String::from_utf8_lossy(kind)
        );
    }
}

#[test]
fn huge_uniform_sample_count_is_rejected() {
    let file = Mp4Builder::new(3)
        .with_table(b"stsz", be32(&[16, u32::MAX]))
        .build();
    let error = first_error(&file);
    assert!(error.to_string().contains("samples"), "{error}");
}

#[test]
fn oversized_stts_run_is_clamped_to_the_sample_count() {
    let builder = Mp4Builder::new(5).with_table(b"stts", be32(&[1, u32::MAX, 100]));
    let (_, samples) = demux_all(&builder.build(), 4096);

    let timestamps: Vec<i64> = samples.iter().map(|sample| sample.timestamp).collect();
    assert_eq!(timestamps, vec![0, 100, 200, 300, 400]);
}

#[test]
fn stsc_pointing_past_the_chunk_table_is_rejected() {
    let file = Mp4Builder::new(3)
        .with_table(b"stsc", be32(&[2, 1, 1, 1, 5, 2, 1]))
        .build();
    assert!(matches!(first_error(&file), FrameServeError::Demux(_)));
}
