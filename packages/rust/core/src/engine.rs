//! Concurrent taxonomy expansion engine.
//!
//! One call to [`Expander::expand`] is one round: authorize, classify every
//! node whose children were requested (one concurrent call per node, grouped
//! into at most two waves), merge, store, return. Workers report over a
//! channel to a single collector, so no lock is held across a network call.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use taxogen_classifier::{ApiKey, Classifier, ClassifyRequest};
use taxogen_shared::{
    CategoryNode, Depth, ExpansionConfig, Forest, NodeId, Principal, Result, TaxogenError,
    Taxonomy, TaxonomyId,
};

use crate::gateway::TaxonomyGateway;
use crate::tree::{self, PendingNode};

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// Input to one expansion round.
#[derive(Debug)]
pub struct ExpansionRequest {
    pub taxonomy_id: TaxonomyId,
    /// Who is asking; must own the taxonomy.
    pub principal: Principal,
    /// The caller's view of the tree. May be newer or older than storage.
    pub forest: Forest,
    /// Used for this round's classification calls only, never stored.
    pub credential: ApiKey,
}

/// Which batch of calls a wave was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveKind {
    /// The single call that turns the domain name into top-level categories.
    Seed,
    /// Categories asking for subcategories.
    Category,
    /// Subcategories asking for sub-subcategories.
    Subcategory,
}

impl std::fmt::Display for WaveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Seed => "seed",
            Self::Category => "category",
            Self::Subcategory => "subcategory",
        })
    }
}

/// Call accounting for one wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveStats {
    pub kind: WaveKind,
    pub issued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Call accounting for one round.
#[derive(Debug, Clone, Default)]
pub struct RoundStats {
    pub waves: Vec<WaveStats>,
    /// Whether the merged forest differs from the one supplied.
    pub changed: bool,
    pub elapsed: Duration,
}

impl RoundStats {
    pub fn calls_issued(&self) -> usize {
        self.waves.iter().map(|w| w.issued).sum()
    }

    pub fn calls_failed(&self) -> usize {
        self.waves.iter().map(|w| w.failed).sum()
    }
}

/// Result of a successful round.
#[derive(Debug, Clone)]
pub struct ExpansionOutcome {
    /// The merged forest, as stored.
    pub forest: Forest,
    pub stats: RoundStats,
}

// ---------------------------------------------------------------------------
// Progress trait
// ---------------------------------------------------------------------------

/// Progress callback for expansion rounds.
pub trait ExpansionProgress: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as each classification call in a wave completes.
    fn node_classified(&self, label: &str, succeeded: bool, done: usize, total: usize);
}

/// No-op expansion progress.
pub struct SilentExpansionProgress;

impl ExpansionProgress for SilentExpansionProgress {
    fn phase(&self, _name: &str) {}
    fn node_classified(&self, _label: &str, _succeeded: bool, _done: usize, _total: usize) {}
}

// ---------------------------------------------------------------------------
// Expander
// ---------------------------------------------------------------------------

/// Runs expansion rounds against a classifier and a persistence gateway.
pub struct Expander {
    classifier: Arc<dyn Classifier>,
    gateway: Arc<dyn TaxonomyGateway>,
    config: ExpansionConfig,
}

impl Expander {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        gateway: Arc<dyn TaxonomyGateway>,
        config: ExpansionConfig,
    ) -> Self {
        Self {
            classifier,
            gateway,
            config,
        }
    }

    /// Run one round, bounded only by the configured round timeout.
    pub async fn expand(
        &self,
        request: ExpansionRequest,
        progress: &dyn ExpansionProgress,
    ) -> Result<ExpansionOutcome> {
        self.expand_with_shutdown(request, progress, std::future::pending::<()>())
            .await
    }

    /// Run one round, abandoning it if `shutdown` resolves first.
    ///
    /// An abandoned round stores nothing, even if some calls had finished.
    #[instrument(skip_all, fields(taxonomy = %request.taxonomy_id, principal = %request.principal))]
    pub async fn expand_with_shutdown<F>(
        &self,
        request: ExpansionRequest,
        progress: &dyn ExpansionProgress,
        shutdown: F,
    ) -> Result<ExpansionOutcome>
    where
        F: Future<Output = ()>,
    {
        let start = Instant::now();
        let ExpansionRequest {
            taxonomy_id,
            principal,
            forest: supplied,
            credential,
        } = request;

        progress.phase("Authorizing");
        let taxonomy = self.authorize(&taxonomy_id, &principal).await?;

        let round_timeout = self.config.round_timeout;
        let deadline = async move {
            match round_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Dropping the round future drops its JoinSet, which aborts workers.
        let (forest, mut stats) = tokio::select! {
            round = self.run_round(&taxonomy, supplied.clone(), &credential, progress) => round?,
            () = shutdown => {
                warn!("expansion cancelled, discarding partial results");
                return Err(TaxogenError::classification_failed("round cancelled"));
            }
            () = deadline => {
                warn!(timeout_secs = ?round_timeout.map(|t| t.as_secs_f64()), "expansion timed out, discarding partial results");
                return Err(TaxogenError::classification_failed("round timed out"));
            }
        };
        stats.changed = forest != supplied;
        stats.elapsed = start.elapsed();

        if stats.waves.is_empty() {
            debug!("no node requested children, nothing to store");
            return Ok(ExpansionOutcome { forest, stats });
        }

        progress.phase("Saving taxonomy");
        let updated = Taxonomy { forest, ..taxonomy };
        self.gateway.store_taxonomy(&updated).await?;

        info!(
            waves = stats.waves.len(),
            calls = stats.calls_issued(),
            failed = stats.calls_failed(),
            elapsed_ms = stats.elapsed.as_millis(),
            "expansion round complete"
        );

        Ok(ExpansionOutcome {
            forest: updated.forest,
            stats,
        })
    }

    async fn authorize(&self, id: &TaxonomyId, principal: &Principal) -> Result<Taxonomy> {
        let owner = self
            .gateway
            .owner_of(id)
            .await?
            .ok_or_else(|| TaxogenError::not_found(id))?;

        if &owner != principal {
            warn!(%principal, "principal does not own taxonomy");
            return Err(TaxogenError::not_authorized(id));
        }

        self.gateway
            .load_taxonomy(id)
            .await?
            .ok_or_else(|| TaxogenError::not_found(id))
    }

    async fn run_round(
        &self,
        taxonomy: &Taxonomy,
        forest: Forest,
        credential: &ApiKey,
        progress: &dyn ExpansionProgress,
    ) -> Result<(Forest, RoundStats)> {
        let mut stats = RoundStats::default();

        if forest.is_empty() {
            let (seeded, wave) = self.seed(taxonomy, credential, progress).await?;
            stats.waves.push(wave);
            return Ok((seeded, stats));
        }

        let mut current = forest;

        let categories = tree::nodes_needing_expansion(&current, Depth::Category);
        let expanded_now: HashSet<usize> = categories
            .iter()
            .filter_map(|n| match n.id {
                NodeId::Category(i) => Some(i),
                NodeId::Subcategory(..) => None,
            })
            .collect();

        if !categories.is_empty() {
            progress.phase("Classifying subcategories");
            let (results, wave) = self
                .run_wave(taxonomy, credential, WaveKind::Category, categories, progress)
                .await?;
            current = tree::merge_children(&current, &results);
            stats.waves.push(wave);
        }

        // Subcategories created by the wave above wait for the next round.
        let subcategories: Vec<PendingNode> =
            tree::nodes_needing_expansion(&current, Depth::Subcategory)
                .into_iter()
                .filter(|n| !matches!(n.id, NodeId::Subcategory(i, _) if expanded_now.contains(&i)))
                .collect();

        if !subcategories.is_empty() {
            progress.phase("Classifying sub-subcategories");
            let (results, wave) = self
                .run_wave(taxonomy, credential, WaveKind::Subcategory, subcategories, progress)
                .await?;
            current = tree::merge_children(&current, &results);
            stats.waves.push(wave);
        }

        Ok((current, stats))
    }

    /// Classify the domain itself to produce the first level.
    async fn seed(
        &self,
        taxonomy: &Taxonomy,
        credential: &ApiKey,
        progress: &dyn ExpansionProgress,
    ) -> Result<(Forest, WaveStats)> {
        progress.phase("Seeding categories");
        let start = Instant::now();
        let request = classify_request(taxonomy, &taxonomy.domain);

        let names = match self.classifier.classify(credential, &request).await {
            Ok(names) => tree::normalize_names(&names),
            Err(e) => {
                warn!(domain = %taxonomy.domain, error = %e, "seed classification failed");
                progress.node_classified(&taxonomy.domain, false, 1, 1);
                return Err(TaxogenError::classification_failed(format!(
                    "seed call for '{}' failed: {e}",
                    taxonomy.domain
                )));
            }
        };
        progress.node_classified(&taxonomy.domain, !names.is_empty(), 1, 1);

        if names.is_empty() {
            return Err(TaxogenError::classification_failed(format!(
                "seed call for '{}' returned no categories",
                taxonomy.domain
            )));
        }

        let forest = Forest::new(
            names
                .into_iter()
                .map(|name| CategoryNode::fresh(name, Depth::Category))
                .collect(),
        )?;

        info!(categories = forest.len(), "seeded top-level categories");
        Ok((
            forest,
            WaveStats {
                kind: WaveKind::Seed,
                issued: 1,
                succeeded: 1,
                failed: 0,
                elapsed: start.elapsed(),
            },
        ))
    }

    /// Classify every node in `nodes` concurrently and collect the successes.
    ///
    /// A call that returns no usable name counts as failed. Fails only when
    /// every call failed; callers never pass an empty wave.
    async fn run_wave(
        &self,
        taxonomy: &Taxonomy,
        credential: &ApiKey,
        kind: WaveKind,
        nodes: Vec<PendingNode>,
        progress: &dyn ExpansionProgress,
    ) -> Result<(HashMap<NodeId, Vec<String>>, WaveStats)> {
        let start = Instant::now();
        let total = nodes.len();
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<(PendingNode, Result<Vec<String>>)>();
        let mut workers = JoinSet::new();

        info!(
            wave = %kind,
            nodes = total,
            concurrency = self.config.concurrency,
            "starting wave"
        );

        for node in nodes {
            let classifier = Arc::clone(&self.classifier);
            let permits = Arc::clone(&permits);
            let credential = credential.clone();
            let request = classify_request(taxonomy, &node.name);
            let tx = tx.clone();

            workers.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => classifier.classify(&credential, &request).await,
                    Err(_) => Err(TaxogenError::Classification("worker pool closed".into())),
                };
                // Only fails if the round was abandoned and the collector dropped.
                let _ = tx.send((node, outcome));
            });
        }
        drop(tx);

        let mut results = HashMap::with_capacity(total);
        let mut done = 0;
        while let Some((node, outcome)) = rx.recv().await {
            done += 1;
            match outcome.map(|names| tree::normalize_names(&names)) {
                Ok(names) if names.is_empty() => {
                    warn!(node = %node.name, "classifier returned no usable names, node stays pending");
                    progress.node_classified(&node.name, false, done, total);
                }
                Ok(names) => {
                    debug!(node = %node.name, children = names.len(), "node classified");
                    progress.node_classified(&node.name, true, done, total);
                    results.insert(node.id, names);
                }
                Err(e) => {
                    warn!(node = %node.name, error = %e, "classification failed, node stays pending");
                    progress.node_classified(&node.name, false, done, total);
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "classification worker did not finish");
            }
        }

        let stats = WaveStats {
            kind,
            issued: total,
            succeeded: results.len(),
            failed: total - results.len(),
            elapsed: start.elapsed(),
        };

        info!(
            wave = %kind,
            succeeded = stats.succeeded,
            failed = stats.failed,
            elapsed_ms = stats.elapsed.as_millis(),
            "wave joined"
        );

        if results.is_empty() {
            return Err(TaxogenError::classification_failed(format!(
                "all {total} {kind} calls failed"
            )));
        }
        Ok((results, stats))
    }
}

fn classify_request(taxonomy: &Taxonomy, label: &str) -> ClassifyRequest {
    ClassifyRequest {
        domain: taxonomy.domain.clone(),
        context: taxonomy.description.clone(),
        label: label.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use taxogen_shared::Children;
    use taxogen_storage::Storage;
    use uuid::Uuid;

    const SECRET: &str = "sk-test-secret-value";

    /// In-process classifier with canned answers; unknown labels fail.
    #[derive(Default)]
    struct ScriptedClassifier {
        answers: HashMap<String, Vec<String>>,
        delays: HashMap<String, Duration>,
        default_delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedClassifier {
        fn answer(mut self, label: &str, names: &[&str]) -> Self {
            self.answers
                .insert(label.into(), names.iter().map(|s| s.to_string()).collect());
            self
        }

        fn delay(mut self, label: &str, delay: Duration) -> Self {
            self.delays.insert(label.into(), delay);
            self
        }

        fn delay_all(mut self, delay: Duration) -> Self {
            self.default_delay = Some(delay);
            self
        }

        fn calls(&self) -> Vec<String> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort();
            calls
        }
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(
            &self,
            credential: &ApiKey,
            request: &ClassifyRequest,
        ) -> Result<Vec<String>> {
            assert_eq!(credential.expose(), SECRET);
            self.calls.lock().unwrap().push(request.label.clone());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(&request.label).copied().or(self.default_delay) {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.answers.get(&request.label).cloned().ok_or_else(|| {
                TaxogenError::Classification(format!("no answer for {}", request.label))
            })
        }
    }

    /// Records each classified label and whether it was reported as a success.
    #[derive(Default)]
    struct RecordingProgress {
        classified: Mutex<Vec<(String, bool)>>,
    }

    impl ExpansionProgress for RecordingProgress {
        fn phase(&self, _name: &str) {}

        fn node_classified(&self, label: &str, succeeded: bool, _done: usize, _total: usize) {
            self.classified
                .lock()
                .unwrap()
                .push((label.to_string(), succeeded));
        }
    }

    fn populated(name: &str, depth: Depth, children: Vec<CategoryNode>) -> CategoryNode {
        CategoryNode {
            name: name.into(),
            depth,
            children: Children::Populated(children),
        }
    }

    fn pending(name: &str, depth: Depth) -> CategoryNode {
        CategoryNode::fresh(name, depth)
    }

    fn forest(nodes: Vec<CategoryNode>) -> Forest {
        Forest::new(nodes).expect("valid forest")
    }

    /// Temp storage holding one "Animals"/"Biology" taxonomy owned by alice.
    async fn setup(initial: Forest) -> (Arc<Storage>, Taxonomy) {
        let tmp = std::env::temp_dir().join(format!("taxogen_engine_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        let mut taxonomy = Taxonomy::new(Principal::new("alice"), "Animals", "Biology");
        taxonomy.forest = initial;
        storage.insert_taxonomy(&taxonomy).await.expect("insert");
        (Arc::new(storage), taxonomy)
    }

    fn expander(classifier: &Arc<ScriptedClassifier>, storage: &Arc<Storage>) -> Expander {
        expander_with(classifier, storage, ExpansionConfig {
            concurrency: 8,
            round_timeout: None,
        })
    }

    fn expander_with(
        classifier: &Arc<ScriptedClassifier>,
        storage: &Arc<Storage>,
        config: ExpansionConfig,
    ) -> Expander {
        let classifier: Arc<dyn Classifier> = Arc::clone(classifier) as Arc<dyn Classifier>;
        let gateway: Arc<dyn TaxonomyGateway> = Arc::clone(storage) as Arc<dyn TaxonomyGateway>;
        Expander::new(classifier, gateway, config)
    }

    fn request(taxonomy: &Taxonomy, forest: Forest) -> ExpansionRequest {
        ExpansionRequest {
            taxonomy_id: taxonomy.id,
            principal: Principal::new("alice"),
            forest,
            credential: ApiKey::new(SECRET),
        }
    }

    async fn stored(storage: &Storage, taxonomy: &Taxonomy) -> Taxonomy {
        storage
            .get_taxonomy(&taxonomy.id)
            .await
            .expect("load")
            .expect("present")
    }

    #[tokio::test]
    async fn empty_forest_is_seeded_from_the_domain() {
        let (storage, taxonomy) = setup(Forest::empty()).await;
        let classifier = Arc::new(ScriptedClassifier::default().answer("Animals", &["Mammals", "Birds"]));

        let outcome = expander(&classifier, &storage)
            .expand(request(&taxonomy, Forest::empty()), &SilentExpansionProgress)
            .await
            .expect("seed round");

        assert_eq!(classifier.calls(), vec!["Animals"]);
        assert_eq!(
            outcome.forest,
            forest(vec![
                pending("Mammals", Depth::Category),
                pending("Birds", Depth::Category),
            ])
        );
        assert_eq!(outcome.stats.waves[0].kind, WaveKind::Seed);
        assert_eq!(stored(&storage, &taxonomy).await.forest, outcome.forest);
    }

    #[tokio::test]
    async fn failed_seed_leaves_storage_untouched() {
        let (storage, taxonomy) = setup(Forest::empty()).await;
        let before = stored(&storage, &taxonomy).await;
        let classifier = Arc::new(ScriptedClassifier::default());

        let err = expander(&classifier, &storage)
            .expand(request(&taxonomy, Forest::empty()), &SilentExpansionProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, TaxogenError::ClassificationFailed { .. }));
        assert_eq!(classifier.calls().len(), 1);
        assert_eq!(stored(&storage, &taxonomy).await, before);
    }

    #[tokio::test]
    async fn settled_forest_makes_no_calls() {
        let settled = forest(vec![
            populated(
                "Mammals",
                Depth::Category,
                vec![populated(
                    "Rodentia",
                    Depth::Subcategory,
                    vec![CategoryNode::new("Muridae", Depth::SubSubcategory)],
                )],
            ),
            CategoryNode::new("Birds", Depth::Category),
        ]);
        let (storage, taxonomy) = setup(settled.clone()).await;
        let classifier = Arc::new(ScriptedClassifier::default());

        let outcome = expander(&classifier, &storage)
            .expand(request(&taxonomy, settled.clone()), &SilentExpansionProgress)
            .await
            .expect("no-op round");

        assert!(classifier.calls().is_empty());
        assert_eq!(outcome.forest, settled);
        assert!(outcome.stats.waves.is_empty());
        assert!(!outcome.stats.changed);
    }

    #[tokio::test]
    async fn category_wave_fills_subcategories_without_cascading() {
        let input = forest(vec![pending("Mammals", Depth::Category)]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let classifier = Arc::new(
            ScriptedClassifier::default()
                .answer("Mammals", &["Carnivora", "Rodentia"])
                .answer("Carnivora", &["Felidae"]),
        );

        let outcome = expander(&classifier, &storage)
            .expand(request(&taxonomy, input), &SilentExpansionProgress)
            .await
            .expect("round");

        assert_eq!(classifier.calls(), vec!["Mammals"]);
        assert_eq!(
            outcome.forest,
            forest(vec![populated(
                "Mammals",
                Depth::Category,
                vec![
                    pending("Carnivora", Depth::Subcategory),
                    pending("Rodentia", Depth::Subcategory),
                ],
            )])
        );
    }

    #[tokio::test]
    async fn partial_wave_failure_still_succeeds() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            pending("Birds", Depth::Category),
        ]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let classifier = Arc::new(ScriptedClassifier::default().answer("Mammals", &["Carnivora"]));

        let outcome = expander(&classifier, &storage)
            .expand(request(&taxonomy, input), &SilentExpansionProgress)
            .await
            .expect("partial success");

        let birds = &outcome.forest.categories()[1];
        assert!(birds.children.is_requested(), "failed node stays pending");
        assert_eq!(outcome.forest.categories()[0].children.nodes().len(), 1);
        assert_eq!(outcome.stats.waves[0].issued, 2);
        assert_eq!(outcome.stats.waves[0].failed, 1);
        assert_eq!(stored(&storage, &taxonomy).await.forest, outcome.forest);
    }

    #[tokio::test]
    async fn rerun_retries_only_failed_nodes() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            pending("Birds", Depth::Category),
        ]);
        let (storage, taxonomy) = setup(input.clone()).await;

        let flaky = Arc::new(ScriptedClassifier::default().answer("Mammals", &["Carnivora"]));
        let first = expander(&flaky, &storage)
            .expand(request(&taxonomy, input), &SilentExpansionProgress)
            .await
            .expect("first round");

        let healthy = Arc::new(
            ScriptedClassifier::default()
                .answer("Birds", &["Owls"])
                .answer("Carnivora", &["Felidae"]),
        );
        let second = expander(&healthy, &storage)
            .expand(request(&taxonomy, first.forest), &SilentExpansionProgress)
            .await
            .expect("second round");

        // Mammals already has children; only the failed category and the
        // subcategory created last round are classified.
        assert_eq!(healthy.calls(), vec!["Birds", "Carnivora"]);
        assert_eq!(second.forest.categories()[1].children.nodes()[0].name, "Owls");
    }

    #[tokio::test]
    async fn all_calls_failing_leaves_storage_untouched() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            pending("Birds", Depth::Category),
        ]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let before = stored(&storage, &taxonomy).await;
        let classifier = Arc::new(ScriptedClassifier::default());

        let err = expander(&classifier, &storage)
            .expand(request(&taxonomy, input), &SilentExpansionProgress)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("all 2 category calls failed"));
        assert_eq!(classifier.calls().len(), 2);
        assert_eq!(stored(&storage, &taxonomy).await, before);
    }

    #[tokio::test]
    async fn wave_without_usable_names_fails_and_stores_nothing() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            pending("Birds", Depth::Category),
        ]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let before = stored(&storage, &taxonomy).await;
        let classifier = Arc::new(
            ScriptedClassifier::default()
                .answer("Mammals", &[])
                .answer("Birds", &["  ", ""]),
        );

        let err = expander(&classifier, &storage)
            .expand(request(&taxonomy, input), &SilentExpansionProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, TaxogenError::ClassificationFailed { .. }));
        assert_eq!(classifier.calls().len(), 2);
        assert_eq!(stored(&storage, &taxonomy).await, before);
    }

    #[tokio::test]
    async fn empty_answer_counts_as_failed_call() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            pending("Birds", Depth::Category),
        ]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let classifier = Arc::new(
            ScriptedClassifier::default()
                .answer("Mammals", &[])
                .answer("Birds", &["Owls"]),
        );
        let progress = RecordingProgress::default();

        let outcome = expander(&classifier, &storage)
            .expand(request(&taxonomy, input), &progress)
            .await
            .expect("partial success");

        assert!(outcome.forest.categories()[0].children.is_requested());
        assert_eq!(outcome.forest.categories()[1].children.nodes()[0].name, "Owls");
        assert_eq!(outcome.stats.waves[0].succeeded, 1);
        assert_eq!(outcome.stats.waves[0].failed, 1);

        let mut reported = progress.classified.lock().unwrap().clone();
        reported.sort();
        assert_eq!(
            reported,
            vec![("Birds".to_string(), true), ("Mammals".to_string(), false)]
        );
        assert_eq!(stored(&storage, &taxonomy).await.forest, outcome.forest);
    }

    #[tokio::test]
    async fn both_waves_run_in_one_round() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            populated(
                "Birds",
                Depth::Category,
                vec![pending("Passeriformes", Depth::Subcategory)],
            ),
        ]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let classifier = Arc::new(
            ScriptedClassifier::default()
                .answer("Mammals", &["Carnivora"])
                .answer("Passeriformes", &["Corvidae", "Paridae"]),
        );

        let outcome = expander(&classifier, &storage)
            .expand(request(&taxonomy, input), &SilentExpansionProgress)
            .await
            .expect("round");

        assert_eq!(classifier.calls(), vec!["Mammals", "Passeriformes"]);
        let kinds: Vec<WaveKind> = outcome.stats.waves.iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WaveKind::Category, WaveKind::Subcategory]);

        let passeriformes = &outcome.forest.categories()[1].children.nodes()[0];
        let leaves: Vec<&str> = passeriformes
            .children
            .nodes()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(leaves, vec!["Corvidae", "Paridae"]);
        assert!(passeriformes.children.nodes().iter().all(|n| n.children.is_unrequested()));
        outcome.forest.validate().expect("three levels at most");
    }

    #[tokio::test]
    async fn failed_second_wave_discards_the_first() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            populated(
                "Birds",
                Depth::Category,
                vec![pending("Passeriformes", Depth::Subcategory)],
            ),
        ]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let before = stored(&storage, &taxonomy).await;
        let classifier = Arc::new(ScriptedClassifier::default().answer("Mammals", &["Carnivora"]));

        let err = expander(&classifier, &storage)
            .expand(request(&taxonomy, input), &SilentExpansionProgress)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("subcategory"));
        assert_eq!(stored(&storage, &taxonomy).await, before);
    }

    #[tokio::test]
    async fn completion_order_does_not_change_the_merge() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            pending("Birds", Depth::Category),
            pending("Fish", Depth::Category),
        ]);
        let script = |slow: &str| {
            ScriptedClassifier::default()
                .answer("Mammals", &["Carnivora", "Rodentia"])
                .answer("Birds", &["Owls"])
                .answer("Fish", &["Sharks"])
                .delay(slow, Duration::from_millis(60))
        };

        let mut forests = Vec::new();
        for slow in ["Mammals", "Birds", "Fish"] {
            let (storage, taxonomy) = setup(input.clone()).await;
            let classifier = Arc::new(script(slow));
            let outcome = expander(&classifier, &storage)
                .expand(request(&taxonomy, input.clone()), &SilentExpansionProgress)
                .await
                .expect("round");
            forests.push(outcome.forest);
        }

        assert_eq!(forests[0], forests[1]);
        assert_eq!(forests[1], forests[2]);
    }

    #[tokio::test]
    async fn wave_runs_concurrently_within_the_limit() {
        let labels = ["A", "B", "C", "D", "E"];
        let input = forest(labels.iter().map(|l| pending(l, Depth::Category)).collect());

        let script = || {
            labels
                .iter()
                .fold(ScriptedClassifier::default(), |c, l| c.answer(l, &["x"]))
                .delay_all(Duration::from_millis(40))
        };

        let (storage, taxonomy) = setup(input.clone()).await;
        let unbounded = Arc::new(script());
        expander(&unbounded, &storage)
            .expand(request(&taxonomy, input.clone()), &SilentExpansionProgress)
            .await
            .expect("round");
        assert_eq!(unbounded.max_in_flight.load(Ordering::SeqCst), 5);

        let (storage, taxonomy) = setup(input.clone()).await;
        let capped = Arc::new(script());
        expander_with(&capped, &storage, ExpansionConfig {
            concurrency: 2,
            round_timeout: None,
        })
        .expand(request(&taxonomy, input), &SilentExpansionProgress)
        .await
        .expect("round");
        assert_eq!(capped.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(capped.calls().len(), 5);
    }

    #[tokio::test]
    async fn cancellation_discards_completed_calls() {
        let input = forest(vec![
            pending("Mammals", Depth::Category),
            pending("Birds", Depth::Category),
        ]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let before = stored(&storage, &taxonomy).await;
        let classifier = Arc::new(
            ScriptedClassifier::default()
                .answer("Mammals", &["Carnivora"])
                .answer("Birds", &["Owls"])
                .delay("Birds", Duration::from_secs(30)),
        );

        let err = expander(&classifier, &storage)
            .expand_with_shutdown(
                request(&taxonomy, input),
                &SilentExpansionProgress,
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cancelled"));
        assert_eq!(stored(&storage, &taxonomy).await, before);
    }

    #[tokio::test]
    async fn round_timeout_fails_the_round() {
        let input = forest(vec![pending("Mammals", Depth::Category)]);
        let (storage, taxonomy) = setup(input.clone()).await;
        let classifier = Arc::new(
            ScriptedClassifier::default()
                .answer("Mammals", &["Carnivora"])
                .delay_all(Duration::from_secs(30)),
        );

        let err = expander_with(&classifier, &storage, ExpansionConfig {
            concurrency: 4,
            round_timeout: Some(Duration::from_millis(50)),
        })
        .expand(request(&taxonomy, input), &SilentExpansionProgress)
        .await
        .unwrap_err();

        assert!(matches!(err, TaxogenError::ClassificationFailed { ref reason } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn unknown_taxonomy_is_not_found() {
        let (storage, taxonomy) = setup(Forest::empty()).await;
        let classifier = Arc::new(ScriptedClassifier::default());
        let mut req = request(&taxonomy, Forest::empty());
        req.taxonomy_id = TaxonomyId::new();

        let err = expander(&classifier, &storage)
            .expand(req, &SilentExpansionProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TaxogenError::NotFound { .. }));
        assert!(classifier.calls().is_empty());
    }

    #[tokio::test]
    async fn other_principals_are_not_authorized() {
        let (storage, taxonomy) = setup(Forest::empty()).await;
        let classifier = Arc::new(ScriptedClassifier::default().answer("Animals", &["Mammals"]));
        let mut req = request(&taxonomy, Forest::empty());
        req.principal = Principal::new("mallory");

        let err = expander(&classifier, &storage)
            .expand(req, &SilentExpansionProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TaxogenError::NotAuthorized { .. }));
        assert!(classifier.calls().is_empty());
    }

    #[tokio::test]
    async fn credential_is_never_persisted() {
        let (storage, taxonomy) = setup(Forest::empty()).await;
        let classifier = Arc::new(ScriptedClassifier::default().answer("Animals", &["Mammals"]));
        let req = request(&taxonomy, Forest::empty());
        assert!(!format!("{req:?}").contains(SECRET));

        expander(&classifier, &storage)
            .expand(req, &SilentExpansionProgress)
            .await
            .expect("round");

        let json = serde_json::to_string(&stored(&storage, &taxonomy).await).unwrap();
        assert!(!json.contains(SECRET));
        assert!(json.contains("Mammals"));
    }
}
