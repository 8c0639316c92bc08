use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Parser, Debug)]
#[command(name = "facecount", about = "Face tracking and doorway crossing counting")]
struct Args {
    /// JSONL detection stream, one frame per line ("-" reads stdin)
    #[arg(long, value_name = "PATH")]
    detections: PathBuf,
    /// Frame width in pixels of the detector's coordinate space
    #[arg(long, default_value_t = 640.0)]
    frame_width: f32,
    /// Maximum center distance for a detection to match an existing track
    #[arg(long, default_value_t = 100.0)]
    proximity_threshold: f32,
    /// Consecutive missed frames a track survives before eviction
    #[arg(long, default_value_t = 5)]
    max_missing: u32,
    /// Counting line position as a fraction of frame width
    #[arg(long, default_value_t = 0.5)]
    line_fraction: f32,
    #[arg(long)]
    log_json: Option<PathBuf>,
    /// Emit a summary log every N frames (0 disables periodic summaries)
    #[arg(long, default_value_t = 300)]
    log_interval_frames: u64,
}

/// Axis-aligned face bounding box in the detector's coordinate space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct FaceBox {
    origin_x: f32,
    origin_y: f32,
    width: f32,
    height: f32,
}

/// Which side of the counting line a track's center is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn of(center_x: f32, line_x: f32) -> Self {
        if center_x < line_x {
            Side::Left
        } else {
            Side::Right
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Crossing {
    Enter,
    Exit,
}

impl Crossing {
    fn as_str(self) -> &'static str {
        match self {
            Crossing::Enter => "enter",
            Crossing::Exit => "exit",
        }
    }
}

/// A persistent identity for one face across frames.
#[derive(Clone, Debug)]
struct Track {
    id: usize,
    /// Last known mirrored center, updated only on a match.
    center_x: f32,
    side: Side,
    entered: bool,
    exited: bool,
    missed_frames: u32,
    /// Most recent box, carried forward unchanged while ghosted.
    last_box: FaceBox,
}

/// One crossing fired by the counting rule this frame.
#[derive(Clone, Debug)]
struct CrossingEvent {
    track_id: usize,
    direction: Crossing,
    center_x: f32,
    last_box: FaceBox,
}

#[derive(Debug, Default)]
struct FrameStats {
    matched: usize,
    new_tracks: usize,
    ghosted_tracks: usize,
    removed_tracks: usize,
    active_tracks: usize,
    crossings: Vec<CrossingEvent>,
}

/// Greedy nearest-center multi-face tracker with directional line counting.
///
/// Detections are associated to tracks by horizontal center distance alone.
/// Motion between consecutive frames is small and faces rarely overlap in a
/// single-file doorway, so a hard proximity gate is enough. The miss
/// tolerance bridges brief detector dropouts (blinks, partial occlusion)
/// without fragmenting one physical crossing into multiple tracks.
struct FaceTracker {
    /// Insertion-ordered, so iteration order is ascending track id.
    tracks: Vec<Track>,
    next_id: usize,
    proximity_threshold: f32,
    max_missing: u32,
    line_fraction: f32,
    enter_count: u64,
    exit_count: u64,
}

impl FaceTracker {
    fn new(proximity_threshold: f32, max_missing: u32, line_fraction: f32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            proximity_threshold,
            max_missing,
            line_fraction,
            enter_count: 0,
            exit_count: 0,
        }
    }

    /// Total number of ids ever issued.
    fn total_unique(&self) -> usize {
        self.next_id.saturating_sub(1)
    }

    fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Tracks that matched a detection this frame, for rendering consumers.
    fn visible_tracks(&self) -> Vec<&Track> {
        self.tracks.iter().filter(|t| t.missed_frames == 0).collect()
    }

    fn enter_count(&self) -> u64 {
        self.enter_count
    }

    fn exit_count(&self) -> u64 {
        self.exit_count
    }

    fn update(&mut self, detections: &[FaceBox], frame_width: f32) -> FrameStats {
        let mut stats = FrameStats::default();
        let line_x = frame_width * self.line_fraction;

        let centers: Vec<f32> = detections
            .iter()
            .map(|b| mirrored_center_x(b, frame_width))
            .collect();

        // Phase 1: greedy nearest-center association, oldest track first.
        // Each match removes the detection from the pool, so a contested
        // detection always goes to the lower track id.
        let mut claimed = vec![false; detections.len()];
        let mut matches: Vec<Option<usize>> = vec![None; self.tracks.len()];
        for (track_idx, track) in self.tracks.iter().enumerate() {
            let mut best_idx = None;
            let mut best_dist = f32::INFINITY;
            for (det_idx, &center) in centers.iter().enumerate() {
                if claimed[det_idx] {
                    continue;
                }
                let dist = (center - track.center_x).abs();
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(det_idx);
                }
            }
            if let Some(det_idx) = best_idx {
                if best_dist < self.proximity_threshold {
                    claimed[det_idx] = true;
                    matches[track_idx] = Some(det_idx);
                }
            }
        }

        // Phase 2: apply matches and evaluate the crossing rule, then age
        // unmatched tracks. The crossing check always compares against the
        // side held before this frame's update.
        for (track_idx, track) in self.tracks.iter_mut().enumerate() {
            match matches[track_idx] {
                Some(det_idx) => {
                    track.center_x = centers[det_idx];
                    track.last_box = detections[det_idx].clone();
                    track.missed_frames = 0;
                    stats.matched += 1;

                    let current_side = Side::of(track.center_x, line_x);
                    if current_side != track.side {
                        if track.side == Side::Left && !track.entered {
                            track.entered = true;
                            self.enter_count += 1;
                            stats.crossings.push(CrossingEvent {
                                track_id: track.id,
                                direction: Crossing::Enter,
                                center_x: track.center_x,
                                last_box: track.last_box.clone(),
                            });
                        } else if track.side == Side::Right && !track.exited {
                            track.exited = true;
                            self.exit_count += 1;
                            stats.crossings.push(CrossingEvent {
                                track_id: track.id,
                                direction: Crossing::Exit,
                                center_x: track.center_x,
                                last_box: track.last_box.clone(),
                            });
                        }
                    }
                    track.side = current_side;
                }
                None => {
                    // Ghosted: presumed stationary, position and side frozen.
                    track.missed_frames += 1;
                    if track.missed_frames <= self.max_missing {
                        stats.ghosted_tracks += 1;
                    }
                }
            }
        }

        // Phase 3: evict tracks missing longer than the tolerance.
        let max_missing = self.max_missing;
        self.tracks.retain(|track| {
            if track.missed_frames > max_missing {
                stats.removed_tracks += 1;
                false
            } else {
                true
            }
        });

        // Phase 4: spawn new tracks for detections nothing claimed. A brand
        // new track never fires a crossing on its creation frame.
        for (det_idx, det) in detections.iter().enumerate() {
            if claimed[det_idx] {
                continue;
            }
            let center_x = centers[det_idx];
            self.tracks.push(Track {
                id: self.next_id,
                center_x,
                side: Side::of(center_x, line_x),
                entered: false,
                exited: false,
                missed_frames: 0,
                last_box: det.clone(),
            });
            self.next_id += 1;
            stats.new_tracks += 1;
        }

        stats.active_tracks = self.tracks.len();
        stats
    }
}

/// Canonical horizontal center of a box after horizontal mirroring.
///
/// The detector sees the raw camera image while the operator-facing display
/// is mirrored, so every distance and side computation happens in the
/// as-displayed coordinate space. Applied identically when matching against
/// existing tracks and when seeding new ones.
fn mirrored_center_x(b: &FaceBox, frame_width: f32) -> f32 {
    let mirrored_origin = frame_width - b.origin_x - b.width;
    mirrored_origin + b.width / 2.0
}

/// One line of the replay stream: every detection reported for a single frame.
#[derive(Debug, Default, Deserialize)]
struct FrameRecord {
    #[serde(default)]
    boxes: Vec<FaceBox>,
}

#[derive(Serialize)]
struct SessionLog {
    event: &'static str,
    timestamp: String,
    source: String,
    frame_width: f32,
    proximity_threshold: f32,
    max_missing: u32,
    line_fraction: f32,
}

#[derive(Serialize)]
struct FrameLog {
    event: &'static str,
    timestamp: String,
    frame_index: u64,
    detections: usize,
    matched: usize,
    new_tracks: usize,
    ghosted_tracks: usize,
    removed_tracks: usize,
    active_tracks: usize,
    visible_tracks: usize,
    enter_count: u64,
    exit_count: u64,
}

#[derive(Serialize)]
struct CrossingLog {
    event: &'static str,
    timestamp: String,
    frame_index: u64,
    track_id: usize,
    direction: &'static str,
    center_x: f32,
    last_box: FaceBox,
    enter_count: u64,
    exit_count: u64,
}

#[derive(Serialize)]
struct SummaryLog {
    event: &'static str,
    timestamp: String,
    frame_index: u64,
    interval_frames: u64,
    interval_detections: u64,
    total_unique: usize,
    active_tracks: usize,
    enter_count: u64,
    exit_count: u64,
}

struct JsonLogger {
    writer: BufWriter<File>,
}

impl JsonLogger {
    fn new(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_event<T: Serialize>(&mut self, event: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    let source = args.detections.display().to_string();
    let reader: Box<dyn BufRead> = if args.detections.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.detections)
            .with_context(|| format!("Failed to open detection stream: {}", source))?;
        Box::new(BufReader::new(file))
    };

    let mut json_logger = match args.log_json.as_ref() {
        Some(path) => Some(JsonLogger::new(path)?),
        None => None,
    };

    if let Some(logger) = json_logger.as_mut() {
        let session = SessionLog {
            event: "session_start",
            timestamp: timestamp_now(),
            source: source.clone(),
            frame_width: args.frame_width,
            proximity_threshold: args.proximity_threshold,
            max_missing: args.max_missing,
            line_fraction: args.line_fraction,
        };
        logger.write_event(&session)?;
        logger.flush()?;
    }

    let mut tracker = FaceTracker::new(
        args.proximity_threshold,
        args.max_missing,
        args.line_fraction,
    );

    let mut frame_index: u64 = 0;
    let mut interval_frames: u64 = 0;
    let mut interval_detections: u64 = 0;

    for (line_number, line) in reader.lines().enumerate() {
        let line = line
            .with_context(|| format!("Failed to read line {} of {}", line_number + 1, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: FrameRecord = serde_json::from_str(&line).with_context(|| {
            format!("Malformed frame record on line {} of {}", line_number + 1, source)
        })?;

        frame_index += 1;
        interval_frames += 1;
        interval_detections += record.boxes.len() as u64;

        let stats = tracker.update(&record.boxes, args.frame_width);

        for crossing in &stats.crossings {
            tracing::info!(
                "frame={} track={} {} at x={:.1} entered={} exited={}",
                frame_index,
                crossing.track_id,
                crossing.direction.as_str(),
                crossing.center_x,
                tracker.enter_count(),
                tracker.exit_count()
            );
            if let Some(logger) = json_logger.as_mut() {
                let log = CrossingLog {
                    event: "crossing",
                    timestamp: timestamp_now(),
                    frame_index,
                    track_id: crossing.track_id,
                    direction: crossing.direction.as_str(),
                    center_x: crossing.center_x,
                    last_box: crossing.last_box.clone(),
                    enter_count: tracker.enter_count(),
                    exit_count: tracker.exit_count(),
                };
                logger.write_event(&log)?;
            }
        }

        if let Some(logger) = json_logger.as_mut() {
            let frame_log = FrameLog {
                event: "frame",
                timestamp: timestamp_now(),
                frame_index,
                detections: record.boxes.len(),
                matched: stats.matched,
                new_tracks: stats.new_tracks,
                ghosted_tracks: stats.ghosted_tracks,
                removed_tracks: stats.removed_tracks,
                active_tracks: stats.active_tracks,
                visible_tracks: tracker.visible_tracks().len(),
                enter_count: tracker.enter_count(),
                exit_count: tracker.exit_count(),
            };
            logger.write_event(&frame_log)?;
        }

        if args.log_interval_frames > 0 && frame_index % args.log_interval_frames == 0 {
            tracing::info!(
                "frames={} active={} unique={} entered={} exited={}",
                frame_index,
                stats.active_tracks,
                tracker.total_unique(),
                tracker.enter_count(),
                tracker.exit_count()
            );
            if let Some(logger) = json_logger.as_mut() {
                let summary = SummaryLog {
                    event: "summary",
                    timestamp: timestamp_now(),
                    frame_index,
                    interval_frames,
                    interval_detections,
                    total_unique: tracker.total_unique(),
                    active_tracks: stats.active_tracks,
                    enter_count: tracker.enter_count(),
                    exit_count: tracker.exit_count(),
                };
                logger.write_event(&summary)?;
                logger.flush()?;
            }
            interval_frames = 0;
            interval_detections = 0;
        }
    }

    tracing::info!(
        "done: frames={} active={} unique={} entered={} exited={}",
        frame_index,
        tracker.tracks().len(),
        tracker.total_unique(),
        tracker.enter_count(),
        tracker.exit_count()
    );
    if let Some(logger) = json_logger.as_mut() {
        let summary = SummaryLog {
            event: "summary",
            timestamp: timestamp_now(),
            frame_index,
            interval_frames,
            interval_detections,
            total_unique: tracker.total_unique(),
            active_tracks: tracker.tracks().len(),
            enter_count: tracker.enter_count(),
            exit_count: tracker.exit_count(),
        };
        logger.write_event(&summary)?;
        logger.flush()?;
    }
    Ok(())
}

fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDTH: f32 = 640.0;

    /// Build a box whose mirrored center lands at `center_x`.
    fn box_at(center_x: f32) -> FaceBox {
        let width = 80.0;
        FaceBox {
            origin_x: WIDTH - center_x - width / 2.0,
            origin_y: 120.0,
            width,
            height: 80.0,
        }
    }

    fn tracker() -> FaceTracker {
        FaceTracker::new(100.0, 5, 0.5)
    }

    #[test]
    fn normalizer_mirrors_box_center() {
        // A box hugging the left edge of the raw frame displays at the right edge.
        let b = FaceBox {
            origin_x: 0.0,
            origin_y: 0.0,
            width: 100.0,
            height: 100.0,
        };
        assert_eq!(mirrored_center_x(&b, WIDTH), 590.0);
        assert_eq!(mirrored_center_x(&b, WIDTH), mirrored_center_x(&b, WIDTH));
        assert_eq!(mirrored_center_x(&box_at(250.0), WIDTH), 250.0);
    }

    #[test]
    fn detection_spawns_track_without_counting() {
        let mut t = tracker();
        let stats = t.update(&[box_at(400.0)], WIDTH);
        assert_eq!(stats.new_tracks, 1);
        assert_eq!(stats.matched, 0);
        assert!(stats.crossings.is_empty());
        assert_eq!(t.enter_count(), 0);
        assert_eq!(t.exit_count(), 0);

        let track = &t.tracks()[0];
        assert_eq!(track.id, 1);
        assert_eq!(track.side, Side::Right);
        assert_eq!(track.missed_frames, 0);
        assert!(!track.entered);
        assert!(!track.exited);
    }

    #[test]
    fn crossing_counts_enter_then_exit_once() {
        let mut t = tracker();
        t.update(&[box_at(310.0)], WIDTH); // left of the 320 line

        let stats = t.update(&[box_at(330.0)], WIDTH);
        assert_eq!(stats.crossings.len(), 1);
        assert_eq!(stats.crossings[0].direction, Crossing::Enter);
        assert_eq!(stats.crossings[0].track_id, 1);
        assert_eq!(stats.crossings[0].last_box, box_at(330.0));
        assert_eq!(t.enter_count(), 1);
        assert_eq!(t.exit_count(), 0);

        let stats = t.update(&[box_at(310.0)], WIDTH);
        assert_eq!(stats.crossings.len(), 1);
        assert_eq!(stats.crossings[0].direction, Crossing::Exit);
        assert_eq!(t.enter_count(), 1);
        assert_eq!(t.exit_count(), 1);

        // Further oscillation never double counts.
        t.update(&[box_at(330.0)], WIDTH);
        t.update(&[box_at(310.0)], WIDTH);
        t.update(&[box_at(330.0)], WIDTH);
        assert_eq!(t.enter_count(), 1);
        assert_eq!(t.exit_count(), 1);
        assert_eq!(t.total_unique(), 1);
    }

    #[test]
    fn center_exactly_on_line_is_right() {
        let mut t = tracker();
        t.update(&[box_at(320.0)], WIDTH);
        assert_eq!(t.tracks()[0].side, Side::Right);

        // Moving strictly left of the line from there is an exit.
        t.update(&[box_at(310.0)], WIDTH);
        assert_eq!(t.exit_count(), 1);
        assert_eq!(t.enter_count(), 0);
    }

    #[test]
    fn ghost_survives_tolerance_then_removed() {
        let mut t = tracker();
        t.update(&[box_at(200.0)], WIDTH);

        for _ in 0..5 {
            let stats = t.update(&[], WIDTH);
            assert_eq!(stats.removed_tracks, 0);
            assert_eq!(stats.ghosted_tracks, 1);
        }
        assert_eq!(t.tracks().len(), 1);
        assert_eq!(t.tracks()[0].missed_frames, 5);

        let stats = t.update(&[], WIDTH);
        assert_eq!(stats.removed_tracks, 1);
        assert!(t.tracks().is_empty());
    }

    #[test]
    fn ghost_keeps_position_and_resumes_identity() {
        let mut t = tracker();
        t.update(&[box_at(200.0)], WIDTH);
        t.update(&[], WIDTH);

        let track = &t.tracks()[0];
        assert_eq!(track.center_x, 200.0);
        assert_eq!(track.side, Side::Left);
        assert_eq!(track.missed_frames, 1);
        assert_eq!(track.last_box, box_at(200.0));

        // Reappearing within the gate resumes the same identity.
        let stats = t.update(&[box_at(230.0)], WIDTH);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.new_tracks, 0);
        assert_eq!(t.tracks()[0].id, 1);
        assert_eq!(t.tracks()[0].missed_frames, 0);
        assert_eq!(t.tracks()[0].center_x, 230.0);
    }

    #[test]
    fn reappearance_after_eviction_gets_new_id() {
        let mut t = tracker();
        t.update(&[box_at(200.0)], WIDTH);
        for _ in 0..6 {
            t.update(&[], WIDTH);
        }
        assert!(t.tracks().is_empty());

        t.update(&[box_at(200.0)], WIDTH);
        assert_eq!(t.tracks()[0].id, 2);
        assert_eq!(t.total_unique(), 2);
    }

    #[test]
    fn nearer_detection_wins_farther_spawns() {
        let mut t = tracker();
        t.update(&[box_at(300.0)], WIDTH);

        // Both within the gate of track 1; only the nearer one matches.
        let stats = t.update(&[box_at(360.0), box_at(310.0)], WIDTH);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.new_tracks, 1);
        assert_eq!(t.tracks()[0].id, 1);
        assert_eq!(t.tracks()[0].center_x, 310.0);
        assert_eq!(t.tracks()[1].id, 2);
        assert_eq!(t.tracks()[1].center_x, 360.0);
    }

    #[test]
    fn far_detection_never_force_matches() {
        let mut t = tracker();
        t.update(&[box_at(100.0)], WIDTH);

        let stats = t.update(&[box_at(250.0)], WIDTH);
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.new_tracks, 1);
        assert_eq!(t.tracks().len(), 2);
        assert_eq!(t.tracks()[0].missed_frames, 1);
    }

    #[test]
    fn proximity_gate_is_strict() {
        let mut t = tracker();
        t.update(&[box_at(100.0)], WIDTH);

        // Exactly at the threshold distance is not a match.
        let stats = t.update(&[box_at(200.0)], WIDTH);
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.new_tracks, 1);
    }

    #[test]
    fn contested_detection_goes_to_older_track() {
        let mut t = tracker();
        t.update(&[box_at(400.0), box_at(440.0)], WIDTH);
        assert_eq!(t.tracks()[0].id, 1);
        assert_eq!(t.tracks()[1].id, 2);

        // Equidistant from both tracks; the older id claims it.
        let stats = t.update(&[box_at(420.0)], WIDTH);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.ghosted_tracks, 1);
        assert_eq!(t.tracks()[0].id, 1);
        assert_eq!(t.tracks()[0].center_x, 420.0);
        assert_eq!(t.tracks()[1].id, 2);
        assert_eq!(t.tracks()[1].missed_frames, 1);
        assert_eq!(t.tracks()[1].center_x, 440.0);
    }

    #[test]
    fn ghosts_never_fire_crossings() {
        let mut t = tracker();
        t.update(&[box_at(310.0)], WIDTH);
        for _ in 0..5 {
            let stats = t.update(&[], WIDTH);
            assert!(stats.crossings.is_empty());
        }
        assert_eq!(t.enter_count(), 0);
        assert_eq!(t.exit_count(), 0);
    }

    #[test]
    fn empty_frames_on_empty_tracker_are_noops() {
        let mut t = tracker();
        let stats = t.update(&[], WIDTH);
        assert_eq!(stats.active_tracks, 0);
        assert_eq!(stats.removed_tracks, 0);
        assert!(t.tracks().is_empty());
        assert_eq!(t.total_unique(), 0);
    }

    #[test]
    fn visible_tracks_excludes_ghosts() {
        let mut t = tracker();
        t.update(&[box_at(200.0), box_at(500.0)], WIDTH);
        t.update(&[box_at(200.0)], WIDTH);

        let visible = t.visible_tracks();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, 1);
        assert_eq!(t.tracks().len(), 2);
    }

    #[test]
    fn frame_record_parsing() {
        let record: FrameRecord = serde_json::from_str(
            r#"{"boxes":[{"origin_x":1.0,"origin_y":2.0,"width":3.0,"height":4.0}]}"#,
        )
        .unwrap();
        assert_eq!(record.boxes.len(), 1);
        assert_eq!(record.boxes[0].width, 3.0);

        let empty: FrameRecord = serde_json::from_str("{}").unwrap();
        assert!(empty.boxes.is_empty());

        assert!(serde_json::from_str::<FrameRecord>("not json").is_err());
    }
}
