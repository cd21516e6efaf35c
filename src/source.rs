//! Asynchronous tile providers.
//!
//! A [`TileSource`] accepts tile ids and later yields decoded tiles on a
//! polled, non-blocking interface; completions may arrive out of order and
//! duplicate requests are ignored. Decoding runs behind the source
//! boundary, so the render thread never blocks on it.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread;

use thiserror::Error;

use crate::healpix::{patch_to_lng_lat, TileId};
use crate::tile::{Rgb8, Tile, TileSample};

/// Failure a source reports for a single tile. Transient problems are
/// retried inside the source and never surface here.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("permanent tile failure: {0}")]
    Permanent(String),
}

/// One completed (or failed) tile request.
#[derive(Debug)]
pub struct TileLoad<T: TileSample> {
    pub id: TileId,
    pub result: Result<Tile<T>, SourceError>,
}

/// Contract between the residency manager and a tile producer. A source is
/// specialized to one channel and one sample type.
pub trait TileSource<T: TileSample>: Send {
    /// Called once when the source is attached.
    fn init(&mut self) {}

    /// Shut down and drain outstanding work.
    fn fini(&mut self);

    /// Non-blocking enqueue. Ids already pending may be ignored.
    fn request(&mut self, ids: &[TileId]);

    /// Non-blocking drain of finished requests; empty is legal.
    fn poll(&mut self) -> Vec<TileLoad<T>>;

    /// Fixed sample-grid resolution of every tile this source produces.
    fn resolution(&self) -> u32;
}

/// Decodes the sample grid for one tile. Implementations must be cheap to
/// share across worker threads.
pub trait TileReader<T: TileSample>: Send + Sync + 'static {
    fn read(&self, id: TileId, resolution: u32) -> Result<Vec<T>, SourceError>;
}

// ---------------- worker-pool source ----------------

/// Tile source running a reader on a small worker pool. Requests go through
/// a bounded channel to a round-robin dispatcher; completions come back on
/// an unbounded channel drained by [`TileSource::poll`].
pub struct AsyncTileSource<T: TileSample> {
    resolution: u32,
    max_in_flight: usize,
    req_tx: Option<SyncSender<TileId>>,
    done_rx: Receiver<TileLoad<T>>,
    dispatcher: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    worker_txs: Vec<Sender<TileId>>,
    pending: HashSet<TileId>,
}

impl<T: TileSample> AsyncTileSource<T> {
    pub fn new(
        reader: Arc<dyn TileReader<T>>,
        resolution: u32,
        max_in_flight: usize,
        pool_size: usize,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        let (req_tx, req_rx) = mpsc::sync_channel::<TileId>(max_in_flight);
        let (done_tx, done_rx) = mpsc::channel::<TileLoad<T>>();

        let mut worker_txs = Vec::new();
        let mut workers = Vec::new();
        for _ in 0..pool_size.max(1) {
            let (wtx, wrx) = mpsc::channel::<TileId>();
            worker_txs.push(wtx);
            let done_tx = done_tx.clone();
            let reader = reader.clone();
            workers.push(thread::spawn(move || {
                while let Ok(id) = wrx.recv() {
                    let result = reader.read(id, resolution).and_then(|samples| {
                        Tile::new(id, resolution, samples)
                            .map_err(|e| SourceError::Permanent(e.to_string()))
                    });
                    let _ = done_tx.send(TileLoad { id, result });
                }
            }));
        }

        let dispatch_txs = worker_txs.clone();
        let dispatcher = thread::spawn(move || {
            let mut idx = 0_usize;
            while let Ok(id) = req_rx.recv() {
                let _ = dispatch_txs[idx % dispatch_txs.len()].send(id);
                idx = idx.wrapping_add(1);
            }
        });

        Self {
            resolution,
            max_in_flight,
            req_tx: Some(req_tx),
            done_rx,
            dispatcher: Some(dispatcher),
            workers,
            worker_txs,
            pending: HashSet::new(),
        }
    }

    fn shutdown(&mut self) {
        // hang up the request channel; the dispatcher exits, then the
        // workers lose their senders and exit too
        self.req_tx = None;
        self.worker_txs.clear();
        if let Some(d) = self.dispatcher.take() {
            let _ = d.join();
        }
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        while self.done_rx.try_recv().is_ok() {}
        self.pending.clear();
    }
}

impl<T: TileSample> TileSource<T> for AsyncTileSource<T> {
    fn fini(&mut self) {
        self.shutdown();
    }

    fn request(&mut self, ids: &[TileId]) {
        let Some(req_tx) = &self.req_tx else { return };
        for &id in ids {
            if self.pending.contains(&id) || self.pending.len() >= self.max_in_flight {
                continue;
            }
            if req_tx.try_send(id).is_ok() {
                self.pending.insert(id);
            }
        }
    }

    fn poll(&mut self) -> Vec<TileLoad<T>> {
        let mut out = Vec::new();
        loop {
            match self.done_rx.try_recv() {
                Ok(load) => {
                    self.pending.remove(&load.id);
                    out.push(load);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    fn resolution(&self) -> u32 {
        self.resolution
    }
}

impl<T: TileSample> Drop for AsyncTileSource<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------- synchronous source ----------------

/// Source that decodes queued requests on the render thread at the next
/// `poll`. Deterministic; used by tests and warm-up paths.
pub struct ImmediateTileSource<T: TileSample> {
    reader: Arc<dyn TileReader<T>>,
    resolution: u32,
    queue: Vec<TileId>,
    queued: HashSet<TileId>,
    requests_received: usize,
}

impl<T: TileSample> ImmediateTileSource<T> {
    pub fn new(reader: Arc<dyn TileReader<T>>, resolution: u32) -> Self {
        Self {
            reader,
            resolution,
            queue: Vec::new(),
            queued: HashSet::new(),
            requests_received: 0,
        }
    }

    /// Total ids ever accepted; duplicates of queued ids do not count.
    pub fn requests_received(&self) -> usize {
        self.requests_received
    }
}

impl<T: TileSample> TileSource<T> for ImmediateTileSource<T> {
    fn fini(&mut self) {
        self.queue.clear();
        self.queued.clear();
    }

    fn request(&mut self, ids: &[TileId]) {
        for &id in ids {
            if self.queued.insert(id) {
                self.queue.push(id);
                self.requests_received += 1;
            }
        }
    }

    fn poll(&mut self) -> Vec<TileLoad<T>> {
        let mut out = Vec::with_capacity(self.queue.len());
        for id in self.queue.drain(..) {
            self.queued.remove(&id);
            let result = self.reader.read(id, self.resolution).and_then(|samples| {
                Tile::new(id, self.resolution, samples)
                    .map_err(|e| SourceError::Permanent(e.to_string()))
            });
            out.push(TileLoad { id, result });
        }
        out
    }

    fn resolution(&self) -> u32 {
        self.resolution
    }
}

// ---------------- procedural readers ----------------

/// Analytic elevation: smooth continental-scale undulation over the sphere.
pub struct ProceduralElevation {
    pub amplitude: f32,
}

impl ProceduralElevation {
    pub fn new(amplitude: f32) -> Self {
        Self { amplitude }
    }
}

impl TileReader<f32> for ProceduralElevation {
    fn read(&self, id: TileId, resolution: u32) -> Result<Vec<f32>, SourceError> {
        let (root, x, y) = id.base_xy();
        let n = id.n_side() as f64;
        let step = if resolution > 1 {
            1.0 / (resolution - 1) as f64
        } else {
            0.0
        };

        let mut samples = Vec::with_capacity((resolution * resolution) as usize);
        for j in 0..resolution {
            for i in 0..resolution {
                let u = (x as f64 + i as f64 * step) / n;
                let v = (y as f64 + j as f64 * step) / n;
                let ll = patch_to_lng_lat(root, u, v);
                let h = (3.0 * ll.x).sin() * (2.0 * ll.y).cos();
                samples.push(self.amplitude * h as f32);
            }
        }
        Ok(samples)
    }
}

/// Analytic imagery: latitude bands shaded by longitude.
pub struct ProceduralColor;

impl TileReader<Rgb8> for ProceduralColor {
    fn read(&self, id: TileId, resolution: u32) -> Result<Vec<Rgb8>, SourceError> {
        let (root, x, y) = id.base_xy();
        let n = id.n_side() as f64;
        let step = if resolution > 1 {
            1.0 / (resolution - 1) as f64
        } else {
            0.0
        };

        let mut samples = Vec::with_capacity((resolution * resolution) as usize);
        for j in 0..resolution {
            for i in 0..resolution {
                let u = (x as f64 + i as f64 * step) / n;
                let v = (y as f64 + j as f64 * step) / n;
                let ll = patch_to_lng_lat(root, u, v);
                let r = ((ll.x.sin() * 0.5 + 0.5) * 255.0) as u8;
                let g = ((ll.y.cos() * 0.5 + 0.5) * 255.0) as u8;
                let b = (((ll.x + ll.y).sin() * 0.5 + 0.5) * 255.0) as u8;
                samples.push(Rgb8::new(r, g, b));
            }
        }
        Ok(samples)
    }
}

// ---------------- file-backed readers ----------------

fn expand_template(template: &str, id: TileId) -> String {
    template
        .replace("{level}", &id.level.to_string())
        .replace("{root}", &id.root.to_string())
        .replace("{patch}", &id.patch.to_string())
}

/// Reads elevation tiles from 16-bit grayscale images addressed by a path
/// template like `"/data/dem/{level}/{root}/{patch}.png"`. Pixel values are
/// mapped to `v / 65535 * scale + offset`.
pub struct FileElevationReader {
    template: String,
    scale: f32,
    offset: f32,
}

impl FileElevationReader {
    pub fn new(template: String, scale: f32, offset: f32) -> Self {
        Self {
            template,
            scale,
            offset,
        }
    }
}

impl TileReader<f32> for FileElevationReader {
    fn read(&self, id: TileId, resolution: u32) -> Result<Vec<f32>, SourceError> {
        let path = expand_template(&self.template, id);
        let img = image::open(&path)
            .map_err(|e| SourceError::Permanent(format!("{}: {}", path, e)))?;
        let gray = img.to_luma16();
        let gray = if gray.dimensions() != (resolution, resolution) {
            image::imageops::resize(
                &gray,
                resolution,
                resolution,
                image::imageops::FilterType::Triangle,
            )
        } else {
            gray
        };
        Ok(gray
            .as_raw()
            .iter()
            .map(|&v| (v as f32 / 65535.0) * self.scale + self.offset)
            .collect())
    }
}

/// Reads color tiles from RGB images addressed by a path template.
pub struct FileColorReader {
    template: String,
}

impl FileColorReader {
    pub fn new(template: String) -> Self {
        Self { template }
    }
}

impl TileReader<Rgb8> for FileColorReader {
    fn read(&self, id: TileId, resolution: u32) -> Result<Vec<Rgb8>, SourceError> {
        let path = expand_template(&self.template, id);
        let img = image::open(&path)
            .map_err(|e| SourceError::Permanent(format!("{}: {}", path, e)))?;
        let rgb = img.to_rgb8();
        let rgb = if rgb.dimensions() != (resolution, resolution) {
            image::imageops::resize(
                &rgb,
                resolution,
                resolution,
                image::imageops::FilterType::Triangle,
            )
        } else {
            rgb
        };
        Ok(rgb
            .as_raw()
            .chunks_exact(3)
            .map(|c| Rgb8::new(c[0], c[1], c[2]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_immediate_source_completes_on_poll() {
        let mut src = ImmediateTileSource::new(Arc::new(ProceduralElevation::new(1.0)), 4);
        let ids = [TileId::root_id(0), TileId::root_id(5)];
        src.request(&ids);
        // duplicate request is absorbed
        src.request(&ids[..1]);
        assert_eq!(src.requests_received(), 2);

        let loads = src.poll();
        assert_eq!(loads.len(), 2);
        for load in &loads {
            let tile = load.result.as_ref().unwrap();
            assert_eq!(tile.resolution(), 4);
            assert_eq!(tile.samples().len(), 16);
        }
        assert!(src.poll().is_empty());
    }

    #[test]
    fn test_procedural_elevation_is_deterministic() {
        let reader = ProceduralElevation::new(2.0);
        let a = reader.read(TileId::new(1, 4, 2), 8).unwrap();
        let b = reader.read(TileId::new(1, 4, 2), 8).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|h| h.abs() <= 2.0));
    }

    #[test]
    fn test_async_source_round_trip() {
        let mut src: AsyncTileSource<f32> =
            AsyncTileSource::new(Arc::new(ProceduralElevation::new(1.0)), 4, 32, 2);
        let ids: Vec<TileId> = (0..8).map(|k| TileId::root_id(k as u8)).collect();
        src.request(&ids);

        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while got.len() < ids.len() && Instant::now() < deadline {
            got.extend(src.poll());
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(got.len(), ids.len());
        let mut roots: Vec<u8> = got.iter().map(|l| l.id.root).collect();
        roots.sort_unstable();
        assert_eq!(roots, (0..8).collect::<Vec<u8>>());

        src.fini();
        assert!(src.poll().is_empty());
    }

    #[test]
    fn test_file_reader_missing_tile_is_permanent() {
        let reader = FileElevationReader::new("/nonexistent/{level}/{root}/{patch}.png".into(), 1.0, 0.0);
        let err = reader.read(TileId::root_id(0), 4).unwrap_err();
        let SourceError::Permanent(msg) = err;
        assert!(msg.contains("/nonexistent/0/0/0.png"));
    }

    #[test]
    fn test_template_expansion() {
        let id = TileId::new(3, 11, 42);
        assert_eq!(
            expand_template("{level}-{root}-{patch}", id),
            "3-11-42".to_string()
        );
    }
}
