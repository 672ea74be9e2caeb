//! The analysis of one dataset directory.
//!
//! Every derived value is an artifact: the accessor loads it when its file exists and
//! otherwise computes it from upstream artifacts, saves it, and returns it.

use crate::diffexp::{self, TrackDiffexp};
use crate::dim_red;
use crate::error::AnalysisError;
use crate::factorization::{self, FactorizeOptions, Factorizer, PoissonStateEstimator};
use crate::guard::{diffexp_lock_name, LockFile, MemoCache, MemoKey};
use crate::mtx;
use crate::params::{AnalysisParams, BaselineVis, DimRedMethod, LockConfig};
use crate::recluster::{self, ClusterState, ReclusterOp};
use crate::rules::{self, Criterion, CustomSelection, MetadataField, Resolvers};
use crate::store::{check_track_name, write_atomic, Artifact, ArtifactStore, Codec, DiffexpMode, FileStamp};
use crate::subset;
use anyhow::{bail, Context, Error};
use diff_exp::{NormalizedCells, PairwiseTable, RankedGenes};
use log::info;
use ndarray::{Array2, Axis};
use sc_types::{ColorTrack, CountMatrix, TrackSource, TrackValues};
use serde::de::DeserializeOwned;
use serde::Serialize;
use snoop::{NoOpSnoop, Progress};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the built-in track holding the clustering
pub const CLUSTER_TRACK: &str = "cluster";

pub const PARAMS_FILE: &str = "params.json";
pub const SUBMITTED_FILE: &str = "submitted";
pub const ERROR_FILE: &str = "error.txt";
pub const UPLOADED_TRACKS_FILE: &str = "color_tracks.json";
pub const CUSTOM_SELECTIONS_FILE: &str = "custom_selections.json";
pub const GENE_NAMES_FILE: &str = "gene_names.txt";

/// Memoized function names, used as cache keys
const MEMO_DIFFEXP: &str = "calculate_diffexp";
const MEMO_TOP_GENES: &str = "cluster_top_genes";

/// One row of a top-genes table
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GeneScore {
    pub gene: String,
    pub index: usize,
    pub score: f64,
    pub pval: f64,
}

/// A color track as listed for the web layer
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackInfo {
    pub name: String,
    pub source: TrackSource,
    pub discrete: bool,
}

pub struct Analysis {
    dir: PathBuf,
    id: String,
    params: AnalysisParams,
    store: ArtifactStore,
    factorizer: Arc<dyn Factorizer>,
    memo: Arc<MemoCache>,
    lock_config: LockConfig,
    state: ClusterState,
    data: Option<Arc<CountMatrix>>,
    cells: Option<Arc<Vec<usize>>>,
    data_subset: Option<Arc<CountMatrix>>,
    normalized: Option<Arc<NormalizedCells>>,
    gene_names: Option<Arc<Vec<String>>>,
    /// `cells_subset.txt` version the cell caches were built from
    cells_stamp: Option<FileStamp>,
    /// custom selections being evaluated, to catch selections that refer to themselves
    evaluating: Vec<String>,
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, Error> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    write_atomic(path, |w| {
        serde_json::to_writer_pretty(w, value)?;
        Ok(())
    })
}

impl Analysis {
    /// Open a dataset directory, reading `params.json` when present.
    pub fn open(dir: impl AsRef<Path>, memo: Arc<MemoCache>) -> Result<Analysis, Error> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            bail!(AnalysisError::not_found(dir.display().to_string()));
        }
        let params = AnalysisParams::load(dir.join(PARAMS_FILE))?;
        Ok(Analysis::with_params(dir, params, memo))
    }

    pub fn with_params(dir: impl AsRef<Path>, params: AnalysisParams, memo: Arc<MemoCache>) -> Analysis {
        let dir = dir.as_ref().to_path_buf();
        let id = fs::canonicalize(&dir).unwrap_or_else(|_| dir.clone()).display().to_string();
        Analysis {
            store: ArtifactStore::new(&dir),
            dir,
            id,
            params,
            factorizer: Arc::new(PoissonStateEstimator),
            memo,
            lock_config: LockConfig::default(),
            state: ClusterState::Stable,
            data: None,
            cells: None,
            data_subset: None,
            normalized: None,
            gene_names: None,
            cells_stamp: None,
            evaluating: Vec::new(),
        }
    }

    pub fn with_factorizer(mut self, factorizer: Arc<dyn Factorizer>) -> Analysis {
        self.factorizer = factorizer;
        self
    }

    pub fn with_lock_config(mut self, config: LockConfig) -> Analysis {
        self.lock_config = config;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Dataset identity used in memo keys
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &AnalysisParams {
        &self.params
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn store(&mut self) -> &mut ArtifactStore {
        &mut self.store
    }

    /// Number of times an artifact was computed (not loaded) by this object
    pub fn compute_count(&self, artifact: &Artifact) -> usize {
        self.store.compute_count(artifact)
    }

    fn resolve<T, F>(&mut self, artifact: Artifact, compute: F) -> Result<Arc<T>, Error>
    where
        T: Codec + Send + Sync + 'static,
        F: FnOnce(&mut Analysis) -> Result<T, Error>,
    {
        if self.store.exists(&artifact) {
            return self.store.load(&artifact);
        }
        self.store.note_compute(&artifact);
        let value = compute(self).with_context(|| format!("computing {artifact}"))?;
        self.store.save(&artifact, value)
    }

    /// Two artifacts produced by one computation.
    fn resolve_pair<A, B, F>(&mut self, a: Artifact, b: Artifact, compute: F) -> Result<(Arc<A>, Arc<B>), Error>
    where
        A: Codec + Send + Sync + 'static,
        B: Codec + Send + Sync + 'static,
        F: FnOnce(&mut Analysis) -> Result<(A, B), Error>,
    {
        if self.store.exists(&a) && self.store.exists(&b) {
            return Ok((self.store.load(&a)?, self.store.load(&b)?));
        }
        self.store.note_compute(&a);
        self.store.note_compute(&b);
        let (va, vb) = compute(self).with_context(|| format!("computing {a} and {b}"))?;
        Ok((self.store.save(&a, va)?, self.store.save(&b, vb)?))
    }

    // ---- inputs ----

    /// Raw genes x cells counts.
    pub fn data(&mut self) -> Result<Arc<CountMatrix>, Error> {
        if let Some(d) = &self.data {
            return Ok(d.clone());
        }
        let path = mtx::find_data_file(&self.dir).ok_or_else(|| AnalysisError::not_found("data"))?;
        let d = Arc::new(mtx::load_matrix(path)?);
        self.data = Some(d.clone());
        Ok(d)
    }

    /// Gene names, or gene indices when the dataset has none.
    pub fn gene_names(&mut self) -> Result<Arc<Vec<String>>, Error> {
        if let Some(g) = &self.gene_names {
            return Ok(g.clone());
        }
        let genes = self.data()?.genes();
        let names = match mtx::load_gene_names(self.dir.join(GENE_NAMES_FILE))? {
            Some(names) if names.len() == genes => names,
            Some(names) => bail!(AnalysisError::Compute {
                stage: "gene_names".to_string(),
                message: format!("{} gene names for {} genes", names.len(), genes),
            }),
            None => (0..genes).map(|g| g.to_string()).collect(),
        };
        let names = Arc::new(names);
        self.gene_names = Some(names.clone());
        Ok(names)
    }

    pub fn gene_index(&mut self, gene: &str) -> Result<Option<usize>, Error> {
        Ok(self.gene_names()?.iter().position(|g| g == gene))
    }

    // ---- subsets ----

    pub fn gene_subset(&mut self) -> Result<Arc<Vec<usize>>, Error> {
        self.resolve(Artifact::GeneSubset, |a| {
            let data = a.data()?;
            let subset = subset::select_gene_subset(&data, a.params.genes_frac, a.params.nbins);
            if subset.is_empty() {
                bail!(AnalysisError::Compute {
                    stage: "gene_subset".to_string(),
                    message: "no genes selected".to_string(),
                });
            }
            Ok(subset)
        })
    }

    /// Mask over raw cells of the cells kept for analysis.
    pub fn cell_subset(&mut self) -> Result<Arc<Vec<bool>>, Error> {
        self.resolve(Artifact::CellSubset, |a| {
            let data = a.data()?;
            let mask = subset::select_cell_subset(&data, a.params.min_reads, a.params.max_reads);
            if !mask.iter().any(|&k| k) {
                bail!(AnalysisError::Compute {
                    stage: "cell_subset".to_string(),
                    message: format!("no cells with reads in [{}, {}]", a.params.min_reads, a.params.max_reads),
                });
            }
            Ok(mask)
        })
    }

    /// Drop cell caches built from an older `cells_subset.txt`, e.g. after another
    /// worker deleted cells.
    fn check_cell_caches(&mut self) {
        if self.cells.is_some() && self.store.stamp(&Artifact::CellSubset) != self.cells_stamp {
            info!("cell subset changed on disk, dropping cell caches");
            self.drop_cell_caches();
        }
    }

    /// Raw indices of the analysis cells.
    pub fn cells(&mut self) -> Result<Arc<Vec<usize>>, Error> {
        self.check_cell_caches();
        if let Some(c) = &self.cells {
            return Ok(c.clone());
        }
        let cells = Arc::new(subset::mask_indices(&self.cell_subset()?));
        self.cells_stamp = self.store.stamp(&Artifact::CellSubset);
        self.cells = Some(cells.clone());
        Ok(cells)
    }

    /// Gene subset x analysis cells, the factorization input.
    pub fn data_subset(&mut self) -> Result<Arc<CountMatrix>, Error> {
        self.check_cell_caches();
        if let Some(d) = &self.data_subset {
            return Ok(d.clone());
        }
        let genes = self.gene_subset()?;
        let cells = self.cells()?;
        let d = Arc::new(self.data()?.select(Some(&genes), Some(&cells)));
        self.data_subset = Some(d.clone());
        Ok(d)
    }

    /// All genes x analysis cells, normalized for differential expression.
    pub fn normalized(&mut self) -> Result<Arc<NormalizedCells>, Error> {
        self.check_cell_caches();
        if let Some(n) = &self.normalized {
            return Ok(n.clone());
        }
        let cells = self.cells()?;
        let n = Arc::new(NormalizedCells::new(&self.data()?.select(None, Some(&cells))));
        self.normalized = Some(n.clone());
        Ok(n)
    }

    fn drop_cell_caches(&mut self) {
        self.cells = None;
        self.cells_stamp = None;
        self.data_subset = None;
        self.normalized = None;
    }

    // ---- factorization ----

    pub fn factorization(&mut self) -> Result<(Arc<Array2<f64>>, Arc<Array2<f64>>), Error> {
        self.resolve_pair(Artifact::M, Artifact::W, |a| {
            let data = a.data_subset()?;
            let options = FactorizeOptions {
                max_iters: a.params.max_iters,
                init: None,
            };
            let f = a
                .factorizer
                .factorize(&data, a.params.clusters(), a.params.dist, &options)?;
            Ok((f.m, f.w))
        })
    }

    pub fn m(&mut self) -> Result<Arc<Array2<f64>>, Error> {
        Ok(self.factorization()?.0)
    }

    pub fn w(&mut self) -> Result<Arc<Array2<f64>>, Error> {
        Ok(self.factorization()?.1)
    }

    pub fn labels(&mut self) -> Result<Arc<Vec<usize>>, Error> {
        self.resolve(Artifact::Labels, |a| Ok(factorization::labels_from_w(&*a.w()?)))
    }

    pub fn n_clusters(&mut self) -> Result<usize, Error> {
        Ok(self.w()?.nrows())
    }

    pub fn entropy(&mut self) -> Result<Arc<Vec<f64>>, Error> {
        self.resolve(Artifact::Entropy, |a| Ok(factorization::entropy(&*a.w()?)))
    }

    // ---- visualization ----

    /// Analysis cells shown in plots.
    pub fn cell_sample(&mut self) -> Result<Arc<Vec<usize>>, Error> {
        self.resolve(Artifact::CellSample, |a| {
            Ok(subset::sample_cells(&*a.w()?, a.params.cell_frac, a.params.seed))
        })
    }

    pub fn mds_means(&mut self) -> Result<Arc<Array2<f64>>, Error> {
        self.resolve(Artifact::MdsMeans, |a| dim_red::mds_means(&*a.m()?))
    }

    /// 2-D coordinates of the sampled cells.
    pub fn dim_red(&mut self) -> Result<Arc<Array2<f64>>, Error> {
        self.resolve(Artifact::DimRed, |a| {
            let sample = a.cell_sample()?;
            let w_sample = a.w()?.select(Axis(1), &sample);
            match a.params.vismethod {
                DimRedMethod::Mds => dim_red::dim_red_mds(&*a.mds_means()?, &w_sample),
                DimRedMethod::Pca => dim_red::pca(&w_sample, 2),
            }
        })
    }

    /// Data-only 2-D coordinates of the sampled cells, when configured.
    pub fn baseline_vis(&mut self) -> Result<Option<Arc<Array2<f64>>>, Error> {
        if self.params.baseline_vismethod == BaselineVis::None {
            return Ok(None);
        }
        self.resolve(Artifact::BaselineVis, |a| {
            let sample = a.cell_sample()?;
            let data = a.data_subset()?.select(None, Some(&sample));
            dim_red::tsvd(&data, 2)
        })
        .map(Some)
    }

    // ---- differential expression over the clustering ----

    /// Per-cluster c-score rankings and their p-values.
    pub fn top_genes(&mut self) -> Result<(Arc<RankedGenes>, Arc<RankedGenes>), Error> {
        self.top_genes_reporting(NoOpSnoop)
    }

    /// `top_genes`, reporting permutation progress when it has to be computed.
    pub fn top_genes_reporting(
        &mut self,
        snoop: impl Progress,
    ) -> Result<(Arc<RankedGenes>, Arc<RankedGenes>), Error> {
        self.resolve_pair(Artifact::TopGenes, Artifact::Pvals, |a| {
            let (data, labels, k) = a.diffexp_inputs()?;
            let res = diff_exp::c_score_test(&data, &labels, k, &a.params.diff_exp(), snoop)?;
            Ok(diffexp::rank(&res))
        })
    }

    pub fn pvals(&mut self) -> Result<Arc<RankedGenes>, Error> {
        Ok(self.top_genes()?.1)
    }

    pub fn top_genes_1_vs_rest(&mut self) -> Result<(Arc<RankedGenes>, Arc<RankedGenes>), Error> {
        self.top_genes_1_vs_rest_reporting(NoOpSnoop)
    }

    pub fn top_genes_1_vs_rest_reporting(
        &mut self,
        snoop: impl Progress,
    ) -> Result<(Arc<RankedGenes>, Arc<RankedGenes>), Error> {
        self.resolve_pair(Artifact::TopGenes1VsRest, Artifact::Pvals1VsRest, |a| {
            let (data, labels, k) = a.diffexp_inputs()?;
            let res = diff_exp::one_vs_rest_test(&data, &labels, k, &a.params.diff_exp(), snoop)?;
            Ok(diffexp::rank(&res))
        })
    }

    /// `[a, b, gene]` mean ratios and p-values between every pair of clusters.
    pub fn pairwise(&mut self) -> Result<(Arc<PairwiseTable>, Arc<PairwiseTable>), Error> {
        self.pairwise_reporting(NoOpSnoop)
    }

    pub fn pairwise_reporting(
        &mut self,
        snoop: impl Progress,
    ) -> Result<(Arc<PairwiseTable>, Arc<PairwiseTable>), Error> {
        self.resolve_pair(Artifact::PairwiseRatios, Artifact::PairwisePvals, |a| {
            let (data, labels, k) = a.diffexp_inputs()?;
            let res = diff_exp::pairwise_test(&data, &labels, k, &a.params.diff_exp(), snoop)?;
            Ok((PairwiseTable(res.ratios), PairwiseTable(res.p_values)))
        })
    }

    fn diffexp_inputs(&mut self) -> Result<(Arc<NormalizedCells>, Arc<Vec<usize>>, usize), Error> {
        Ok((self.normalized()?, self.labels()?, self.n_clusters()?))
    }

    /// Top `n` genes of a cluster with names and p-values. Memoized per version of
    /// `top_genes.txt`, so a recluster by any worker retires the entries.
    pub fn cluster_top_genes(&mut self, cluster: usize, n: usize) -> Result<Arc<Vec<GeneScore>>, Error> {
        let k = self.n_clusters()?;
        if cluster >= k {
            bail!(AnalysisError::invalid_cluster(format!("cluster {cluster} out of range for {k} clusters")));
        }
        let (scores, pvals) = self.top_genes()?;
        let version = self
            .store
            .stamp(&Artifact::TopGenes)
            .map_or_else(String::new, |s| s.token());
        let key = MemoKey::new(self.id.clone(), MEMO_TOP_GENES, format!("{cluster}|{n}|{version}"));
        let memo = self.memo.clone();
        memo.get_or_try_insert(key, || {
            let names = self.gene_names()?;
            let pval_of = pvals
                .get(cluster)
                .map(|l| l.iter().copied().collect::<BTreeMap<_, _>>())
                .unwrap_or_default();
            Ok(scores
                .top(cluster, n)
                .iter()
                .map(|&(g, score)| GeneScore {
                    gene: names[g].clone(),
                    index: g,
                    score,
                    pval: pval_of.get(&g).copied().unwrap_or(1.0),
                })
                .collect::<Vec<_>>())
        })
    }

    // ---- color tracks ----

    fn uploaded_tracks(&self) -> Result<BTreeMap<String, ColorTrack>, Error> {
        read_json_or_default(&self.dir.join(UPLOADED_TRACKS_FILE))
    }

    fn custom_selections(&self) -> Result<BTreeMap<String, CustomSelection>, Error> {
        read_json_or_default(&self.dir.join(CUSTOM_SELECTIONS_FILE))
    }

    /// Store an uploaded track. Values may cover the analysis cells or every raw cell.
    pub fn add_color_track(&mut self, name: &str, values: TrackValues) -> Result<(), Error> {
        check_track_name(name)?;
        if name == CLUSTER_TRACK || self.custom_selections()?.contains_key(name) {
            bail!(AnalysisError::InvalidCriterion {
                message: format!("track name {name:?} is already in use"),
            });
        }
        let cells = self.cells()?;
        let raw_cells = self.data()?.cells();
        let values = if values.len() == cells.len() {
            values
        } else if values.len() == raw_cells {
            values.select(&cells)
        } else {
            bail!(AnalysisError::Compute {
                stage: "add_color_track".to_string(),
                message: format!(
                    "{} values, expected {} (analysis cells) or {} (all cells)",
                    values.len(),
                    cells.len(),
                    raw_cells
                ),
            });
        };
        let mut tracks = self.uploaded_tracks()?;
        tracks.insert(name.to_string(), ColorTrack::new(name, TrackSource::Uploaded, values));
        write_json(&self.dir.join(UPLOADED_TRACKS_FILE), &tracks)?;
        info!("added color track {}", name);
        // the track's old results and every selection that may read it are stale now
        self.remove_track_caches(Some(name))?;
        Ok(())
    }

    pub fn create_custom_selection(&mut self, name: &str) -> Result<(), Error> {
        check_track_name(name)?;
        if name == CLUSTER_TRACK || self.uploaded_tracks()?.contains_key(name) {
            bail!(AnalysisError::InvalidCriterion {
                message: format!("track name {name:?} is already in use"),
            });
        }
        let mut selections = self.custom_selections()?;
        if !selections.contains_key(name) {
            selections.insert(name.to_string(), CustomSelection::new(name));
            write_json(&self.dir.join(CUSTOM_SELECTIONS_FILE), &selections)?;
            info!("created custom selection {}", name);
        }
        Ok(())
    }

    pub fn custom_selection(&self, name: &str) -> Result<Option<CustomSelection>, Error> {
        Ok(self.custom_selections()?.remove(name))
    }

    /// Replace one label's criteria, creating the selection and label as needed.
    pub fn update_label_criteria(
        &mut self,
        selection: &str,
        label: &str,
        criteria: Vec<Criterion>,
        color: Option<String>,
    ) -> Result<(), Error> {
        self.create_custom_selection(selection)?;
        let mut selections = self.custom_selections()?;
        if let Some(sel) = selections.get_mut(selection) {
            sel.update_label(label, criteria, color);
        }
        write_json(&self.dir.join(CUSTOM_SELECTIONS_FILE), &selections)?;
        info!("updated label {} of selection {}", label, selection);
        self.remove_track_caches(Some(selection))
    }

    /// Delete per-track caches: all custom selection tracks plus every diffexp result of
    /// custom tracks and of `track`.
    fn remove_track_caches(&mut self, track: Option<&str>) -> Result<(), Error> {
        let custom = self.custom_selections()?;
        for artifact in self.store.track_artifacts()? {
            let stale = match &artifact {
                Artifact::ColorTrack(_) => true,
                Artifact::TrackDiffexp { track: t, .. } => custom.contains_key(t) || Some(t.as_str()) == track,
                _ => false,
            };
            if stale {
                self.store.remove(&artifact)?;
            }
        }
        self.memo.invalidate_functions(&self.id, &[MEMO_DIFFEXP]);
        Ok(())
    }

    pub fn color_track_names(&self) -> Result<Vec<TrackInfo>, Error> {
        let mut names = vec![TrackInfo {
            name: CLUSTER_TRACK.to_string(),
            source: TrackSource::Builtin,
            discrete: true,
        }];
        for (name, t) in self.uploaded_tracks()? {
            names.push(TrackInfo {
                name,
                source: TrackSource::Uploaded,
                discrete: t.is_discrete(),
            });
        }
        for name in self.custom_selections()?.into_keys() {
            names.push(TrackInfo {
                name,
                source: TrackSource::Custom,
                discrete: true,
            });
        }
        Ok(names)
    }

    /// Look up a track by name: the clustering, an uploaded track, or an evaluated
    /// custom selection. `None` when no track has that name.
    pub fn color_track(&mut self, name: &str) -> Result<Option<Arc<ColorTrack>>, Error> {
        if name == CLUSTER_TRACK {
            let labels = self.labels()?;
            let values = TrackValues::Discrete(labels.iter().map(|l| l.to_string()).collect());
            return Ok(Some(Arc::new(ColorTrack::new(CLUSTER_TRACK, TrackSource::Builtin, values))));
        }
        if let Some(t) = self.uploaded_tracks()?.remove(name) {
            return Ok(Some(Arc::new(t)));
        }
        let Some(selection) = self.custom_selections()?.remove(name) else {
            return Ok(None);
        };
        if self.evaluating.iter().any(|n| n == name) {
            bail!(AnalysisError::UnknownSelectionType {
                name: format!("{name} (selection refers to itself)"),
            });
        }
        self.evaluating.push(name.to_string());
        let result = self.resolve(Artifact::ColorTrack(name.to_string()), |a| {
            let n = a.cells()?.len();
            rules::build_selection(&selection, n, a)
        });
        self.evaluating.pop();
        result.map(Some)
    }

    // ---- differential expression over color tracks ----

    /// Differential expression over a discrete color track. The first computation for a
    /// track is guarded by a lock file so that concurrent workers do not repeat it; the
    /// lock is kept fresh while the permutation test runs. Memo entries are tied to the
    /// version of the result file, which any worker's recluster deletes.
    pub fn calculate_diffexp(&mut self, track: &str, mode: DiffexpMode) -> Result<Arc<TrackDiffexp>, Error> {
        check_track_name(track)?;
        let artifact = Artifact::TrackDiffexp {
            track: track.to_string(),
            mode,
        };
        if let Some(stamp) = self.store.stamp(&artifact) {
            let key = self.diffexp_key(track, mode, &stamp);
            if let Some(v) = self.memo.get(&key) {
                return Ok(v);
            }
            let v = self.store.load::<TrackDiffexp>(&artifact)?;
            self.memo.insert(key, v.as_ref().clone());
            return Ok(v);
        }

        let lock = LockFile::acquire(self.dir.join(diffexp_lock_name(track)), &self.lock_config)?;
        // another worker may have finished while we were checking
        let v = self.resolve(artifact.clone(), |a| {
            let t = a.color_track(track)?.ok_or_else(|| AnalysisError::UnknownSelectionType {
                name: track.to_string(),
            })?;
            let TrackValues::Discrete(values) = &t.values else {
                bail!(AnalysisError::Compute {
                    stage: "diffexp".to_string(),
                    message: format!("track {track} is not discrete"),
                });
            };
            let data = a.normalized()?;
            diffexp::track_diffexp(&data, values, mode, &a.params.diff_exp(), lock.heartbeat())
        })?;
        drop(lock);
        if let Some(stamp) = self.store.stamp(&artifact) {
            let key = self.diffexp_key(track, mode, &stamp);
            self.memo.insert(key, v.as_ref().clone());
        }
        Ok(v)
    }

    fn diffexp_key(&self, track: &str, mode: DiffexpMode, stamp: &FileStamp) -> MemoKey {
        MemoKey::new(
            self.id.clone(),
            MEMO_DIFFEXP,
            format!("{}|{}|{}", track, mode.as_str(), stamp.token()),
        )
    }

    // ---- reclustering ----

    /// Apply a recluster operation. Arguments are validated before anything is written.
    pub fn recluster(&mut self, op: ReclusterOp) -> Result<(), Error> {
        if self.params.read_only {
            bail!(AnalysisError::ReadOnlyDataset);
        }
        let (m, w) = self.factorization()?;
        info!("recluster {} on {}", op, self.dir.display());
        let (new_m, new_w, keep) = match &op {
            ReclusterOp::Split(c) => {
                let data = self.data_subset()?;
                let (m2, w2) = recluster::split(
                    &m,
                    &w,
                    *c,
                    &data,
                    self.factorizer.as_ref(),
                    self.params.dist,
                    self.params.max_iters,
                )?;
                (m2, w2, None)
            }
            ReclusterOp::Merge(ids) => {
                let (m2, w2) = recluster::merge(&m, &w, ids)?;
                (m2, w2, None)
            }
            ReclusterOp::New(cells) => {
                let data = self.data_subset()?;
                let (m2, w2) = recluster::new_cluster(&m, &w, cells, &data)?;
                (m2, w2, None)
            }
            ReclusterOp::Delete(cells) => {
                let (w2, keep) = recluster::delete_cells(&w, cells)?;
                (m.as_ref().clone(), w2, Some(keep))
            }
        };

        self.state = ClusterState::Mutating;
        self.store.touch(SUBMITTED_FILE)?;
        let result = self.commit_recluster(new_m, new_w, keep.as_deref());
        self.store.remove_file(SUBMITTED_FILE);
        self.state = ClusterState::Stable;
        result
    }

    fn commit_recluster(&mut self, m: Array2<f64>, w: Array2<f64>, keep: Option<&[bool]>) -> Result<(), Error> {
        for artifact in Artifact::CLUSTER_DERIVED.iter() {
            self.store.remove(artifact)?;
        }
        for artifact in self.store.track_artifacts()? {
            self.store.remove(&artifact)?;
        }
        if let Some(keep) = keep {
            self.delete_cells_from_artifacts(keep)?;
        }
        let labels = factorization::labels_from_w(&w);
        self.store.save(&Artifact::M, m)?;
        self.store.save(&Artifact::W, w)?;
        self.store.save(&Artifact::Labels, labels)?;
        let n = self.memo.invalidate_dataset(&self.id);
        info!("recluster committed, {} memo entries dropped", n);
        Ok(())
    }

    /// Remove deleted cells from every cell-indexed artifact.
    fn delete_cells_from_artifacts(&mut self, keep: &[bool]) -> Result<(), Error> {
        let cells = self.cells()?;
        let mut mask = self.cell_subset()?.as_ref().clone();
        for (&raw, &k) in cells.iter().zip(keep) {
            if !k {
                mask[raw] = false;
            }
        }
        self.store.save(&Artifact::CellSubset, mask)?;

        let mut tracks = self.uploaded_tracks()?;
        if !tracks.is_empty() {
            for t in tracks.values_mut() {
                t.values = t.values.retain(keep);
            }
            write_json(&self.dir.join(UPLOADED_TRACKS_FILE), &tracks)?;
        }

        if self.store.exists(&Artifact::CellSample) {
            let sample = self.store.load::<Vec<usize>>(&Artifact::CellSample)?;
            let kept_columns = sample
                .iter()
                .enumerate()
                .filter(|(_, &c)| keep.get(c).copied().unwrap_or(false))
                .map(|(j, _)| j)
                .collect::<Vec<_>>();
            for artifact in [Artifact::DimRed, Artifact::BaselineVis] {
                if self.store.exists(&artifact) {
                    let coords = self.store.load::<Array2<f64>>(&artifact)?;
                    self.store.save(&artifact, coords.select(Axis(1), &kept_columns))?;
                }
            }
            self.store.save(&Artifact::CellSample, recluster::remap_indices(&sample, keep))?;
        }
        self.drop_cell_caches();
        Ok(())
    }

    // ---- exports ----

    /// Write the raw counts of some analysis cells as a new dataset.
    pub fn export_cells(&mut self, cells: &[usize], out_dir: impl AsRef<Path>) -> Result<(), Error> {
        let out_dir = out_dir.as_ref();
        let analysis_cells = self.cells()?;
        let raw = cells
            .iter()
            .map(|&c| {
                analysis_cells
                    .get(c)
                    .copied()
                    .ok_or_else(|| AnalysisError::invalid_cluster(format!("cell {c} out of range")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sub = self.data()?.select(None, Some(&raw));
        fs::create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;
        write_atomic(&out_dir.join("data.mtx"), |w| mtx::write_mtx(&sub, w))?;
        let names = self.gene_names()?;
        write_atomic(&out_dir.join(GENE_NAMES_FILE), |w| {
            for n in names.iter() {
                writeln!(w, "{n}")?;
            }
            Ok(())
        })?;
        info!("exported {} cells to {}", raw.len(), out_dir.display());
        Ok(())
    }
}

impl Resolvers for Analysis {
    fn gene_values(&mut self, gene: &str) -> Result<Option<Vec<f64>>, Error> {
        let Some(g) = self.gene_index(gene)? else {
            return Ok(None);
        };
        let values = self.data()?.gene_values(g);
        Ok(Some(self.cells()?.iter().map(|&c| values[c]).collect()))
    }

    fn metadata_values(&mut self, field: MetadataField) -> Result<Vec<f64>, Error> {
        let cells = self.cells()?;
        let data = self.data()?;
        Ok(match field {
            MetadataField::ReadCounts => {
                let sums = data.cell_sums();
                cells.iter().map(|&c| sums[c]).collect()
            }
            MetadataField::GeneCounts => {
                let nnz = data.cell_nnz();
                cells.iter().map(|&c| nnz[c] as f64).collect()
            }
            MetadataField::Entropy => self.entropy()?.as_ref().clone(),
        })
    }

    fn color_track_values(&mut self, name: &str) -> Result<Option<TrackValues>, Error> {
        Ok(self.color_track(name)?.map(|t| t.values.clone()))
    }
}
