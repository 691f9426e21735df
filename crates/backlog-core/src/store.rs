//! The work-item state store for one product.
//!
//! [`Store`] ties the pieces together: identifiers come from the
//! [`Allocator`], records go through the codec under a per-item
//! [`MutationLock`], ownership is enforced by the [`ConflictGuard`], and
//! every successful write is mirrored into the derived index when it is
//! enabled in incremental mode. Workflow operations live in
//! [`crate::workflow`], parent propagation in [`crate::parent_sync`].

use crate::alloc::{Allocation, Allocator};
use crate::codec;
use crate::config::{self, IndexMode, ProductConfig, ProductSection, SharedDefaults};
use crate::db::{self, freshness, rebuild::RebuildReport};
use crate::error::{Result, StoreError};
use crate::facade::{ListOutcome, QueryFacade};
use crate::guard::{ConflictGuard, LockStatus};
use crate::layout::{self, Layout};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, MutationLock};
use crate::model::item::{Kind, WorkItem};
use crate::model::profile::ProcessProfile;
use crate::model::row::{DerivedIndexRow, ItemFilter};
use crate::worklog;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Options for [`Store::init`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Identifier prefix; derived from the product name when absent.
    pub prefix: Option<String>,
    /// Built-in profile name; the default profile when absent.
    pub profile: Option<String>,
    /// Enable the derived index in the new config.
    pub index: bool,
}

/// Optional fields for [`Store::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub parent: Option<String>,
    pub priority: Option<String>,
    pub area: Option<String>,
    pub iteration: Option<String>,
    pub tags: Vec<String>,
    pub owner: Option<String>,
}

/// A completed write and the non-fatal problems it ran into, such as an
/// index that could not be updated.
#[derive(Debug)]
pub struct Written<T> {
    pub value: T,
    pub warnings: Vec<StoreError>,
}

impl<T> Written<T> {
    #[must_use]
    pub(crate) const fn new(value: T, warnings: Vec<StoreError>) -> Self {
        Self { value, warnings }
    }
}

/// One product namespace opened for reading and writing.
#[derive(Debug)]
pub struct Store {
    layout: Layout,
    product: String,
    prefix: String,
    profile: ProcessProfile,
    config: ProductConfig,
    lock_timeout: Duration,
}

fn config_error(err: &anyhow::Error) -> StoreError {
    StoreError::Config(format!("{err:#}"))
}

impl Store {
    /// Create (or complete) the layout of `product` under `backlog_root`
    /// and open it.
    ///
    /// An existing `config.toml` is left untouched. The first product
    /// initialized under a root becomes its `default_product`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if directories or files cannot be written, and
    /// [`StoreError::Config`] for an invalid prefix or unknown profile.
    pub fn init(backlog_root: &Path, product: &str, options: &InitOptions) -> Result<Self> {
        let layout = Layout::new(backlog_root.join("products").join(product));
        layout.ensure_dirs()?;

        let config_path = layout.config_path();
        if !config_path.exists() {
            let mut config = ProductConfig {
                product: ProductSection {
                    name: Some(product.to_string()),
                    prefix: options.prefix.clone(),
                },
                ..ProductConfig::default()
            };
            if let Some(profile) = &options.profile {
                config.process.profile.clone_from(profile);
            }
            config.index.enabled = options.index;
            config::resolve_prefix(&config, product).map_err(|e| config_error(&e))?;
            config::resolve_profile(&config, layout.root()).map_err(|e| config_error(&e))?;

            let text = toml::to_string_pretty(&config)
                .map_err(|e| StoreError::Config(format!("serialize config: {e}")))?;
            layout::write_atomic(&config_path, text.as_bytes())?;
        }

        let shared = backlog_root.join("_shared").join("defaults.toml");
        if !shared.exists() {
            let defaults = SharedDefaults {
                default_product: Some(product.to_string()),
            };
            let text = toml::to_string_pretty(&defaults)
                .map_err(|e| StoreError::Config(format!("serialize defaults: {e}")))?;
            layout::write_atomic(&shared, text.as_bytes())?;
        }

        info!(product, root = %layout.root().display(), "product initialized");
        Self::open_product(layout.root())
    }

    /// Open `product` under `backlog_root`, or the default product.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] when no product can be chosen or its
    /// configuration is invalid, and [`StoreError::NotInitialized`] when
    /// the product directory has no layout.
    pub fn open(backlog_root: &Path, product: Option<&str>) -> Result<Self> {
        let root =
            config::resolve_product_root(backlog_root, product).map_err(|e| config_error(&e))?;
        Self::open_product(&root)
    }

    /// Open the product rooted at `product_root`.
    ///
    /// # Errors
    ///
    /// Same as [`Store::open`].
    pub fn open_product(product_root: &Path) -> Result<Self> {
        let layout = Layout::new(product_root);
        if !layout.exists() {
            return Err(StoreError::NotInitialized {
                path: product_root.to_path_buf(),
            });
        }
        let config = config::load_product_config(product_root).map_err(|e| config_error(&e))?;
        let dir_name = product_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let product = config.product.name.clone().unwrap_or(dir_name);
        let prefix = config::resolve_prefix(&config, &product).map_err(|e| config_error(&e))?;
        let profile =
            config::resolve_profile(&config, product_root).map_err(|e| config_error(&e))?;

        Ok(Self {
            layout,
            product,
            prefix,
            profile,
            config,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Replace the process profile for this handle.
    #[must_use]
    pub fn with_profile(mut self, profile: ProcessProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Bound on waiting for mutation and counter locks.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub const fn profile(&self) -> &ProcessProfile {
        &self.profile
    }

    #[must_use]
    pub const fn config(&self) -> &ProductConfig {
        &self.config
    }

    pub(crate) const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub(crate) const fn guard(&self) -> ConflictGuard<'_> {
        ConflictGuard::new(&self.layout)
    }

    pub(crate) fn mutation_lock(&self, item_id: &str) -> Result<MutationLock> {
        Ok(MutationLock::acquire(
            &self.layout.mutation_lock_path(item_id),
            self.lock_timeout,
        )?)
    }

    /// Issue the next identifier for `kind` without creating a record.
    ///
    /// # Errors
    ///
    /// See [`Allocator::allocate`].
    pub fn allocate(&self, kind: Kind) -> Result<Allocation> {
        Allocator::new(&self.layout, &self.prefix, self.lock_timeout).allocate(kind)
    }

    /// Create a new item in the profile's default state.
    ///
    /// A failed index update does not fail the create; it comes back in
    /// [`Written::warnings`].
    ///
    /// # Errors
    ///
    /// [`StoreError::DanglingParentReference`] if `options.parent` names no
    /// existing item, [`StoreError::InvalidAgent`] for an unusable agent
    /// name, allocation errors, and I/O errors from the write.
    pub fn create(
        &self,
        kind: Kind,
        title: &str,
        agent: &str,
        options: CreateOptions,
    ) -> Result<Written<WorkItem>> {
        codec::validate_agent(agent).map_err(|reason| StoreError::InvalidAgent {
            agent: agent.to_string(),
            reason,
        })?;
        let title = title.trim();
        if title.is_empty() || title.contains(['\n', '\r']) {
            return Err(StoreError::InvalidSection {
                item_id: format!("<new {kind}>"),
                section: "title".to_string(),
                reason: "title must be a non-empty single line".to_string(),
            });
        }
        if let Some(parent) = &options.parent {
            if self.layout.find_record(parent)?.is_none() {
                return Err(StoreError::DanglingParentReference {
                    item_id: format!("<new {kind}>"),
                    parent_id: parent.clone(),
                    reason: "does not exist".to_string(),
                });
            }
        }

        let Allocation { id, seq } = self.allocate(kind)?;
        let now = worklog::now();
        let mut item = WorkItem::new(
            id.clone(),
            kind,
            title.to_string(),
            self.profile.default_state.clone(),
            now,
        );
        item.parent = options.parent;
        if let Some(priority) = options.priority {
            item.priority = priority;
        }
        if let Some(area) = options.area {
            item.area = area;
        }
        item.iteration = options.iteration;
        item.tags = options.tags;
        item.owner = options.owner;
        worklog::append(&mut item, agent, &format!("Created {kind} '{title}'"), now)?;

        let path = self.layout.record_path(kind, &id, seq, title);
        let _mutex = self.mutation_lock(&id)?;
        worklog::persist(&path, &item)?;
        let warnings = self.sync_index(&item, &path);

        info!(item_id = %id, kind = %kind, agent, "item created");
        Ok(Written::new(item, warnings))
    }

    /// Read an item by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::ItemNotFound`] if no record exists, and
    /// [`StoreError::ParseError`] if it does not decode.
    pub fn get(&self, item_id: &str) -> Result<WorkItem> {
        codec::read_record(&self.locate(item_id)?)
    }

    /// Path of the record for `item_id`.
    ///
    /// # Errors
    ///
    /// [`StoreError::ItemNotFound`] if no record exists.
    pub fn locate(&self, item_id: &str) -> Result<PathBuf> {
        self.layout
            .find_record(item_id)?
            .ok_or_else(|| StoreError::ItemNotFound {
                item_id: item_id.to_string(),
            })
    }

    /// Listing facade over the scan and index sources.
    #[must_use]
    pub const fn query(&self) -> QueryFacade<'_> {
        QueryFacade::new(&self.layout, &self.profile, &self.config.index)
    }

    /// Shorthand for `self.query().list(filter)`.
    ///
    /// # Errors
    ///
    /// See [`QueryFacade::list`].
    pub fn list(&self, filter: &ItemFilter) -> Result<ListOutcome> {
        self.query().list(filter)
    }

    /// Rebuild the derived index from the record files.
    ///
    /// # Errors
    ///
    /// See [`QueryFacade::rebuild`].
    pub fn rebuild_index(&self) -> Result<RebuildReport> {
        self.query().rebuild()
    }

    /// Current ownership marker of `item_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker cannot be read.
    pub fn inspect_lock(&self, item_id: &str) -> Result<Option<LockStatus>> {
        self.guard().inspect(item_id)
    }

    /// Every ownership marker in the product.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the locks directory cannot be listed.
    pub fn list_locks(&self) -> Result<Vec<LockStatus>> {
        self.guard().list()
    }

    /// Remove `item_id`'s ownership marker whoever holds it.
    ///
    /// When the item's record exists, the removal is logged in its
    /// worklog under `agent`. Returns the removed marker, `None` when there
    /// was none, along with any index update failure.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidAgent`], lock contention, and I/O errors.
    pub fn break_lock(&self, item_id: &str, agent: &str) -> Result<Written<Option<LockStatus>>> {
        codec::validate_agent(agent).map_err(|reason| StoreError::InvalidAgent {
            agent: agent.to_string(),
            reason,
        })?;
        let _mutex = self.mutation_lock(item_id)?;
        let Some(removed) = self.guard().break_lock(item_id)? else {
            return Ok(Written::new(None, Vec::new()));
        };
        let holder = match &removed {
            LockStatus::Held(info) => info.agent.clone(),
            LockStatus::Unreadable { .. } => "<unreadable marker>".to_string(),
        };
        warn!(item_id, holder = %holder, agent, "ownership lock broken");

        let mut warnings = Vec::new();
        if let Some(path) = self.layout.find_record(item_id)? {
            let mut item = codec::read_record(&path)?;
            worklog::append(
                &mut item,
                agent,
                &format!("Broke ownership lock held by {holder}"),
                worklog::now(),
            )?;
            worklog::persist(&path, &item)?;
            warnings = self.sync_index(&item, &path);
        }
        Ok(Written::new(Some(removed), warnings))
    }

    /// Mirror a just-written record into the index.
    ///
    /// Does nothing when the index is disabled, in rebuild mode, or not
    /// built yet. Failures never undo the write; they come back as
    /// warnings.
    pub(crate) fn sync_index(&self, item: &WorkItem, path: &Path) -> Vec<StoreError> {
        let index = &self.config.index;
        if !index.enabled || index.mode == IndexMode::Rebuild {
            return Vec::new();
        }
        let db_path = self.layout.index_path();
        if !db_path.exists() {
            return Vec::new();
        }

        let result = freshness::stat_file(&self.layout, path)
            .map_err(anyhow::Error::from)
            .and_then(|stat| {
                let row = DerivedIndexRow::from_item(item, stat.rel.clone());
                let mut conn = db::open_index(&db_path)?;
                db::incremental::apply(&mut conn, &row, &stat)
            });
        match result {
            Ok(warnings) => warnings,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "incremental index update failed");
                vec![StoreError::IndexCorrupt {
                    reason: format!("incremental update of {} failed: {e:#}", item.id),
                }]
            }
        }
    }
}
