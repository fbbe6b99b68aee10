//! End-to-end playback of real WAV files through the decode thread.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::f32::consts::TAU;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use segue_audio::{
    AudioPlayer, AudioSource, DecodeLink, DecodeWorker, DefaultCodecFactory, EngineEvent,
    MemoryMetadataStore, NodeEvent, OutputDevice, PlaybackEngine, VirtualClockHandle,
    VirtualOutput,
};
use segue_core::EngineConfig;

fn wav(sample_rate: u32, channels: u16, seconds: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (seconds * sample_rate as f32) as usize;
        for i in 0..frames {
            let value = (TAU * 330.0 * i as f32 / sample_rate as f32).sin() * 0.3;
            for _ in 0..channels {
                writer.write_sample((value * f32::from(i16::MAX)) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn node_events(events: &[EngineEvent]) -> Vec<&NodeEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Node { event, .. } if !matches!(event, NodeEvent::TimeUpdate { .. }) => {
                Some(event)
            }
            _ => None,
        })
        .collect()
}

#[test]
fn test_engine_plays_wav_from_decode_thread() {
    let (output, clock) = VirtualOutput::new(8000, 2);
    let (link, peer) = DecodeLink::pair();
    let decode = DecodeWorker::spawn(
        peer,
        Arc::new(DefaultCodecFactory),
        Arc::new(MemoryMetadataStore::new()),
    )
    .unwrap();
    let mut engine =
        PlaybackEngine::new(Box::new(output), link, EngineConfig::default()).unwrap();
    let events = engine.events();

    let id = engine.create_node().unwrap();
    engine
        .node(id)
        .unwrap()
        .load(AudioSource::memory(wav(8000, 2, 1.0)), 0.0, None)
        .unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !seen.contains(&EngineEvent::Node {
        node: id,
        event: NodeEvent::CanPlay,
    }) {
        assert!(Instant::now() < deadline, "never became playable");
        engine.poll_timeout(Duration::from_millis(10)).unwrap();
        seen.extend(events.try_iter());
    }

    engine.node(id).unwrap().play().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !engine.node_ref(id).unwrap().has_ended() {
        assert!(Instant::now() < deadline, "never ended");
        clock.advance(0.05);
        engine.poll_timeout(Duration::from_millis(5)).unwrap();
        seen.extend(events.try_iter());
    }

    let frames: usize = clock.started_units().iter().map(|u| u.frames).sum();
    assert_eq!(frames, 8000);
    let node = engine.node_ref(id).unwrap();
    assert!((node.duration() - 1.0).abs() < 1e-6);
    assert!(node_events(&seen).contains(&&NodeEvent::Ended {
        had_gapless_continuation: false
    }));

    drop(engine);
    decode.join();
}

fn player() -> (AudioPlayer, VirtualClockHandle) {
    let (output, clock) = VirtualOutput::new(8000, 2);
    let player = AudioPlayer::with_output(
        EngineConfig::default(),
        Arc::new(DefaultCodecFactory),
        Arc::new(MemoryMetadataStore::new()),
        move |_| Ok(Box::new(output) as Box<dyn OutputDevice>),
    )
    .unwrap();
    (player, clock)
}

/// Collect events until one matches, moving the clock along when given.
fn collect_until(
    player: &AudioPlayer,
    clock: Option<&VirtualClockHandle>,
    seen: &mut Vec<EngineEvent>,
    pred: impl Fn(&NodeEvent) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "timed out waiting for event");
        if let Some(clock) = clock {
            clock.advance(0.05);
        }
        if let Some(event) = player.recv_event_timeout(Duration::from_millis(10)) {
            let done = matches!(&event, EngineEvent::Node { event, .. } if pred(event));
            seen.push(event);
            if done {
                return;
            }
        }
    }
}

#[test]
fn test_player_continues_gaplessly_into_next_track() {
    let (player, clock) = player();
    let node = player.create_node().unwrap();
    player
        .load(node, AudioSource::memory(wav(8000, 1, 1.0)), 0.0, None)
        .unwrap();

    let mut seen = Vec::new();
    collect_until(&player, None, &mut seen, |e| *e == NodeEvent::CanPlay);
    if !node_events(&seen).contains(&&NodeEvent::LastBufferQueued) {
        collect_until(&player, None, &mut seen, |e| *e == NodeEvent::LastBufferQueued);
    }
    player.play(node).unwrap();
    player
        .replace(node, AudioSource::memory(wav(8000, 1, 2.0)), 0.0, true, None)
        .unwrap();

    // Hold the clock until the next track is queued behind the current one.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !player.status(node).is_some_and(|s| s.gapless_preload) {
        assert!(Instant::now() < deadline, "preload never arrived");
        seen.extend(player.recv_event_timeout(Duration::from_millis(10)));
    }

    collect_until(&player, Some(&clock), &mut seen, |e| {
        matches!(e, NodeEvent::ReplacementLoaded { .. })
    });

    let events = node_events(&seen);
    let ended = events
        .iter()
        .position(|e| {
            **e == NodeEvent::Ended {
                had_gapless_continuation: true,
            }
        })
        .unwrap();
    assert!(matches!(events[ended + 1], NodeEvent::ReplacementLoaded { .. }));

    std::thread::sleep(Duration::from_millis(50));
    let status = player.status(node).unwrap();
    assert!((status.duration - 2.0).abs() < 1e-6);
    assert!(!status.ended);
}

#[test]
fn test_player_reports_unsupported_file() {
    let (player, _clock) = player();
    let node = player.create_node().unwrap();
    player
        .load(node, AudioSource::memory(b"definitely not audio".to_vec()), 0.0, None)
        .unwrap();
    let mut seen = Vec::new();
    collect_until(&player, None, &mut seen, |e| {
        matches!(
            e,
            NodeEvent::Error {
                kind: segue_core::ErrorKind::CodecUnsupported,
                ..
            }
        )
    });
}
