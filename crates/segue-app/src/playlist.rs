//! Gapless playback of a list of files on a single source node.
//!
//! The next file is handed to the node as a gapless replacement as soon as
//! the current one has its last chunk queued, so the two play back to back.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use segue_audio::{AudioPlayer, AudioSource, EngineEvent, NodeEvent};
use segue_core::TrackInfo;
use tracing::{debug, info, warn};

/// What the driver should do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Nothing,
    /// Queue this file to follow the current one.
    Preload(PathBuf),
    /// Load this file and start it right away.
    Load(PathBuf),
    Finished,
}

#[derive(Debug)]
pub struct Playlist {
    tracks: Vec<PathBuf>,
    current: usize,
    preloading: bool,
}

impl Playlist {
    pub const fn new(tracks: Vec<PathBuf>) -> Self {
        Self {
            tracks,
            current: 0,
            preloading: false,
        }
    }

    pub fn current_track(&self) -> Option<&Path> {
        self.tracks.get(self.current).map(PathBuf::as_path)
    }

    pub const fn position(&self) -> usize {
        self.current
    }

    fn track(&self, index: usize) -> Option<PathBuf> {
        self.tracks.get(index).cloned()
    }

    pub fn on_event(&mut self, event: &NodeEvent) -> Action {
        match event {
            NodeEvent::LastBufferQueued if !self.preloading => {
                match self.track(self.current + 1) {
                    Some(next) => {
                        self.preloading = true;
                        Action::Preload(next)
                    }
                    None => Action::Nothing,
                }
            }
            NodeEvent::ReplacementLoaded { .. } if self.preloading => {
                self.preloading = false;
                self.current += 1;
                Action::Nothing
            }
            // The replacement, if any, is still on its way.
            NodeEvent::Ended {
                had_gapless_continuation: false,
            } if !self.preloading => Action::Finished,
            NodeEvent::Error { .. } => {
                // The failed file is the preloaded one if a preload was out.
                let failed = self.current + usize::from(self.preloading);
                self.preloading = false;
                self.current = failed + 1;
                self.track(self.current).map_or(Action::Finished, Action::Load)
            }
            _ => Action::Nothing,
        }
    }
}

fn track_info(path: &Path) -> TrackInfo {
    TrackInfo::new(path.display().to_string())
}

/// Play every file of `playlist` on a fresh node, returning once the last
/// one has ended.
pub fn play(player: &AudioPlayer, mut playlist: Playlist) -> Result<()> {
    let Some(first) = playlist.current_track().map(Path::to_path_buf) else {
        return Ok(());
    };
    let node = player.create_node()?;
    info!("Now playing {}", first.display());
    player.load(node, AudioSource::file(&first), 0.0, Some(track_info(&first)))?;
    player.play(node)?;

    loop {
        let Some(event) = player.recv_event() else {
            bail!("Audio engine stopped unexpectedly");
        };
        let event = match event {
            EngineEvent::Node { node: id, event } if id == node => event,
            EngineEvent::Fatal { message } => bail!("Audio engine failed: {message}"),
            EngineEvent::OutputReset => {
                info!("Output device reopened");
                continue;
            }
            other => {
                debug!("Ignoring {other:?}");
                continue;
            }
        };
        if let NodeEvent::Error { message, .. } = &event {
            warn!("Skipping unplayable track: {message}");
        }

        let before = playlist.position();
        match playlist.on_event(&event) {
            Action::Nothing => {}
            Action::Preload(path) => {
                debug!("Preloading {}", path.display());
                player.replace(node, AudioSource::file(&path), 0.0, true, Some(track_info(&path)))?;
            }
            Action::Load(path) => {
                info!("Now playing {}", path.display());
                player.load(node, AudioSource::file(&path), 0.0, Some(track_info(&path)))?;
                player.play(node)?;
            }
            Action::Finished => break,
        }
        if playlist.position() != before && matches!(event, NodeEvent::ReplacementLoaded { .. }) {
            if let Some(path) = playlist.current_track() {
                info!("Now playing {}", path.display());
            }
        }
    }

    player.destroy_node(node)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(count: usize) -> Playlist {
        Playlist::new((0..count).map(|i| PathBuf::from(format!("{i}.flac"))).collect())
    }

    fn ended(gapless: bool) -> NodeEvent {
        NodeEvent::Ended {
            had_gapless_continuation: gapless,
        }
    }

    fn replaced() -> NodeEvent {
        NodeEvent::ReplacementLoaded {
            scheduled_start: 0.0,
        }
    }

    #[test]
    fn test_preloads_next_track_once() {
        let mut list = playlist(3);
        assert_eq!(
            list.on_event(&NodeEvent::LastBufferQueued),
            Action::Preload(PathBuf::from("1.flac"))
        );
        assert_eq!(list.on_event(&NodeEvent::LastBufferQueued), Action::Nothing);
    }

    #[test]
    fn test_walks_through_playlist_gaplessly() {
        let mut list = playlist(2);
        list.on_event(&NodeEvent::LastBufferQueued);
        assert_eq!(list.on_event(&ended(true)), Action::Nothing);
        assert_eq!(list.on_event(&replaced()), Action::Nothing);
        assert_eq!(list.current_track(), Some(Path::new("1.flac")));

        assert_eq!(list.on_event(&NodeEvent::LastBufferQueued), Action::Nothing);
        assert_eq!(list.on_event(&ended(false)), Action::Finished);
    }

    #[test]
    fn test_load_announcement_does_not_advance() {
        let mut list = playlist(2);
        assert_eq!(list.on_event(&replaced()), Action::Nothing);
        assert_eq!(list.position(), 0);
    }

    #[test]
    fn test_late_preload_waits_for_replacement() {
        let mut list = playlist(2);
        list.on_event(&NodeEvent::LastBufferQueued);
        assert_eq!(list.on_event(&ended(false)), Action::Nothing);
        list.on_event(&replaced());
        assert_eq!(list.position(), 1);
    }

    #[test]
    fn test_broken_preload_is_skipped() {
        let mut list = playlist(3);
        list.on_event(&NodeEvent::LastBufferQueued);
        let error = NodeEvent::Error {
            kind: segue_core::ErrorKind::CodecUnsupported,
            message: "bad file".into(),
        };
        assert_eq!(list.on_event(&error), Action::Load(PathBuf::from("2.flac")));
        assert_eq!(list.on_event(&error), Action::Finished);
    }
}
