//! Change Digest
//!
//! A single 64-bit hash over every render-global input that the host does not
//! notify individually: the sample times, the texture graph reachable from
//! the render globals, the [`RenderGlobals`] themselves and the content-affecting
//! parts of [`SyncSettings`]. Pull-mode reconciliation is skipped when the
//! digest matches the one stored on the mirror scene.
//!
//! The digest is recomputed in full every cycle. Texture hashing dominates its
//! cost, so [`TextureHasher`] memoises per-node hashes; the memo is dropped
//! whenever the cycle stamp changes.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use xxhash_rust::xxh3::Xxh3;

use crate::identity::StableHandle;
use crate::settings::{
    EnvironmentMode, RenderGlobals, SampleTimes, SyncSettings, SyncSnapshot, ToneOperator,
};
use crate::source::SourceGraph;

/// Hash of a texture node that references itself through its inputs.
const CYCLE_MARKER: u64 = 0x9e37_79b9_7f4a_7c15;
/// Hash contribution of a texture reference the graph cannot resolve.
const MISSING_MARKER: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Summary hash of the render-global state of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeDigest(pub u64);

impl fmt::Display for ChangeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Streaming writer with fixed-width encodings for every field type.
struct DigestWriter {
    hasher: Xxh3,
}

impl DigestWriter {
    fn new() -> Self {
        Self {
            hasher: Xxh3::new(),
        }
    }

    fn u8(&mut self, v: u8) {
        self.hasher.update(&[v]);
    }

    fn bool(&mut self, v: bool) {
        self.u8(u8::from(v));
    }

    fn u64(&mut self, v: u64) {
        self.hasher.update(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.hasher.update(&v.to_bits().to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.hasher.update(&v.to_bits().to_le_bytes());
    }

    fn vec3(&mut self, v: glam::Vec3) {
        self.f32(v.x);
        self.f32(v.y);
        self.f32(v.z);
    }

    fn handle(&mut self, v: Option<StableHandle>) {
        match v {
            Some(h) => {
                self.u8(1);
                self.hasher.update(h.as_bytes());
            }
            None => self.u8(0),
        }
    }

    fn finish(&self) -> u64 {
        self.hasher.digest()
    }
}

// ============================================================================
// Texture hashing
// ============================================================================

/// Memoising recursive hasher for the texture graph.
#[derive(Debug, Default)]
pub struct TextureHasher {
    cache: FxHashMap<StableHandle, u64>,
    stamp: Option<u64>,
    hits: usize,
    misses: usize,
}

impl TextureHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a cycle; the memo survives only while the stamp is unchanged.
    pub fn begin_cycle(&mut self, stamp: u64) {
        if self.stamp != Some(stamp) {
            self.cache.clear();
            self.stamp = Some(stamp);
        }
        self.hits = 0;
        self.misses = 0;
    }

    /// Hashes the texture sub-graph rooted at `root`.
    pub fn hash<G: SourceGraph + ?Sized>(&mut self, graph: &G, root: StableHandle) -> u64 {
        let mut visiting = FxHashSet::default();
        self.hash_node(graph, root, &mut visiting)
    }

    /// Memo hits since the last [`begin_cycle`](Self::begin_cycle).
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Nodes hashed from scratch since the last [`begin_cycle`](Self::begin_cycle).
    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses
    }

    fn hash_node<G: SourceGraph + ?Sized>(
        &mut self,
        graph: &G,
        id: StableHandle,
        visiting: &mut FxHashSet<StableHandle>,
    ) -> u64 {
        if let Some(&hash) = self.cache.get(&id) {
            self.hits += 1;
            return hash;
        }
        if !visiting.insert(id) {
            return CYCLE_MARKER;
        }

        let mut writer = DigestWriter::new();
        writer.handle(Some(id));
        match graph.texture(id) {
            Some(node) => {
                writer.u64(node.content_hash);
                for input in node.inputs {
                    let input_hash = self.hash_node(graph, input, visiting);
                    writer.u64(input_hash);
                }
            }
            None => writer.u64(MISSING_MARKER),
        }

        let hash = writer.finish();
        visiting.remove(&id);
        self.cache.insert(id, hash);
        self.misses += 1;
        hash
    }
}

// ============================================================================
// Digest
// ============================================================================

/// Computes the digest of a cycle, in fixed order: times, textures, globals, settings.
pub fn compute_digest<G: SourceGraph + ?Sized>(
    graph: &G,
    snapshot: &SyncSnapshot,
    textures: &mut TextureHasher,
) -> ChangeDigest {
    let mut writer = DigestWriter::new();

    write_times(&mut writer, snapshot.times);

    let roots = graph.texture_roots();
    writer.u64(roots.len() as u64);
    for root in roots {
        let hash = textures.hash(graph, root);
        writer.u64(hash);
    }

    write_globals(&mut writer, &snapshot.globals);
    write_settings(&mut writer, &snapshot.settings);

    let digest = ChangeDigest(writer.finish());
    log::trace!(
        "Digest {digest} (texture memo: {} hits, {} misses)",
        textures.hits(),
        textures.misses()
    );
    digest
}

fn write_times(writer: &mut DigestWriter, times: SampleTimes) {
    writer.f64(times.t0);
    writer.f64(times.t1);
}

fn write_globals(writer: &mut DigestWriter, globals: &RenderGlobals) {
    let env = &globals.environment;
    writer.u8(match env.mode {
        EnvironmentMode::None => 0,
        EnvironmentMode::Color => 1,
        EnvironmentMode::Sky => 2,
        EnvironmentMode::Texture => 3,
    });
    writer.vec3(env.color);
    writer.f32(env.intensity);
    writer.f32(env.rotation);
    writer.handle(env.texture);

    let ground = &globals.ground;
    writer.bool(ground.enabled);
    writer.f32(ground.height);
    writer.vec3(ground.color);
    writer.bool(ground.shadows_only);

    match &globals.tonemap {
        Some(tonemap) => {
            writer.u8(1);
            writer.u8(match tonemap.operator {
                ToneOperator::Linear => 0,
                ToneOperator::Reinhard => 1,
                ToneOperator::Filmic => 2,
                ToneOperator::Aces => 3,
            });
            writer.f32(tonemap.exposure);
            writer.f32(tonemap.gamma);
        }
        None => writer.u8(0),
    }

    writer.bool(globals.alpha);
    writer.bool(globals.default_lights);
}

fn write_settings(writer: &mut DigestWriter, settings: &SyncSettings) {
    writer.bool(settings.follow_external_refs);
    writer.bool(settings.skip_frozen);
    writer.bool(settings.motion_blur.enabled);
    writer.f32(settings.motion_blur.factor);
    writer.f64(settings.motion_blur.shutter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SyncSettings;
    use crate::source::{MemoryGraph, TextureNode};
    use smallvec::smallvec;

    fn h(n: u128) -> StableHandle {
        StableHandle::from_u128(n)
    }

    fn snapshot(graph: &MemoryGraph, time: f64) -> SyncSnapshot {
        SyncSnapshot::capture(graph, &SyncSettings::default(), time, 1.0 / 30.0)
    }

    fn texture_graph() -> MemoryGraph {
        let mut graph = MemoryGraph::new();
        // 1 -> {2, 3}, 2 -> 3: node 3 is shared.
        graph.textures.insert(h(1), TextureNode { content_hash: 10, inputs: smallvec![h(2), h(3)] });
        graph.textures.insert(h(2), TextureNode { content_hash: 20, inputs: smallvec![h(3)] });
        graph.textures.insert(h(3), TextureNode { content_hash: 30, inputs: smallvec![] });
        graph.texture_roots = vec![h(1)];
        graph
    }

    #[test]
    fn digest_is_stable_without_changes() {
        let graph = texture_graph();
        let mut textures = TextureHasher::new();
        textures.begin_cycle(1);
        let a = compute_digest(&graph, &snapshot(&graph, 0.0), &mut textures);
        textures.begin_cycle(2);
        let b = compute_digest(&graph, &snapshot(&graph, 0.0), &mut textures);
        assert_eq!(a, b);
    }

    #[test]
    fn digest_tracks_time_globals_and_textures() {
        let mut graph = texture_graph();
        let mut textures = TextureHasher::new();
        textures.begin_cycle(1);
        let base = compute_digest(&graph, &snapshot(&graph, 0.0), &mut textures);

        textures.begin_cycle(2);
        assert_ne!(base, compute_digest(&graph, &snapshot(&graph, 1.0), &mut textures));

        graph.globals.ground.enabled = true;
        textures.begin_cycle(3);
        let with_ground = compute_digest(&graph, &snapshot(&graph, 0.0), &mut textures);
        assert_ne!(base, with_ground);

        if let Some(node) = graph.textures.get_mut(&h(3)) {
            node.content_hash = 31;
        }
        textures.begin_cycle(4);
        assert_ne!(with_ground, compute_digest(&graph, &snapshot(&graph, 0.0), &mut textures));
    }

    #[test]
    fn shared_texture_nodes_are_hashed_once() {
        let graph = texture_graph();
        let mut textures = TextureHasher::new();
        textures.begin_cycle(1);
        textures.hash(&graph, h(1));
        assert_eq!(textures.misses(), 3);
        assert_eq!(textures.hits(), 1);
    }

    #[test]
    fn cyclic_texture_graph_terminates() {
        let mut graph = MemoryGraph::new();
        graph.textures.insert(h(1), TextureNode { content_hash: 1, inputs: smallvec![h(2)] });
        graph.textures.insert(h(2), TextureNode { content_hash: 2, inputs: smallvec![h(1)] });
        let mut textures = TextureHasher::new();
        textures.begin_cycle(1);
        let first = textures.hash(&graph, h(1));
        textures.begin_cycle(2);
        assert_eq!(first, textures.hash(&graph, h(1)));
    }
}
