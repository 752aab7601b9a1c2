//! Network configuration distribution.
//!
//! Exactly one profile is active at a time. Writes (apply, refresh) are
//! serialized by a single async mutex; reads go through a swapped `Arc`
//! snapshot and never block behind a write. The updated-broadcast goes out
//! strictly after the snapshot swap.

pub mod store;

use crate::bus::messages::ConfigUpdated;
use crate::bus::{Bus, Envelope, channels};
use crate::clock::Clock;
use crate::error::ProfileError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use store::{ActivePointer, ProfileStore};

/// The active network-configuration document distributed to every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    pub profile_id: String,
    pub tag: String,
    #[serde(default)]
    pub server_ip: Option<String>,
    /// Ordered MOTD lines.
    #[serde(default)]
    pub motd: Vec<String>,
    #[serde(default)]
    pub scoreboard: ScoreboardSection,
    /// Rank visuals keyed by rank ID. A `null` record is tolerated on the
    /// wire but fails validation.
    #[serde(default)]
    pub ranks: BTreeMap<String, Option<RankVisual>>,
    pub updated_at: DateTime<Utc>,
    /// Free-form extension data.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreboardSection {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub footer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankVisual {
    pub display_name: String,
    pub color_code: String,
    pub full_prefix: String,
    pub short_prefix: String,
    pub name_color: String,
}

/// Catalog summary plus the active marker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub profile_id: String,
    pub tag: String,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

/// Validate a profile for activation. All errors are accumulated; an empty
/// list means the profile may become active.
pub fn validate(profile: &NetworkProfile) -> Vec<String> {
    let mut errors = Vec::new();
    if profile.profile_id.trim().is_empty() {
        errors.push("profileId is blank".to_string());
    }
    if profile.tag.trim().is_empty() {
        errors.push("tag is blank".to_string());
    }
    match &profile.scoreboard.title {
        Some(title) if !title.trim().is_empty() => {}
        _ => errors.push("scoreboard.title is blank".to_string()),
    }
    match &profile.scoreboard.footer {
        Some(footer) if !footer.trim().is_empty() => {}
        _ => errors.push("scoreboard.footer is blank".to_string()),
    }
    for (rank_id, visual) in &profile.ranks {
        match visual {
            None => errors.push(format!("rank {rank_id} has no visual record")),
            Some(visual) if visual.display_name.trim().is_empty() => {
                errors.push(format!("rank {rank_id} displayName is blank"));
            }
            Some(_) => {}
        }
    }
    errors
}

/// The profile seeded into an empty catalog on first run.
pub fn default_profile(now: DateTime<Utc>) -> NetworkProfile {
    let mut ranks = BTreeMap::new();
    ranks.insert(
        "default".to_string(),
        Some(RankVisual {
            display_name: "Member".to_string(),
            color_code: "7".to_string(),
            full_prefix: String::new(),
            short_prefix: String::new(),
            name_color: "7".to_string(),
        }),
    );
    NetworkProfile {
        profile_id: "default".to_string(),
        tag: "DEFAULT".to_string(),
        server_ip: None,
        motd: vec!["Welcome to the network".to_string()],
        scoreboard: ScoreboardSection {
            title: Some("Network".to_string()),
            footer: Some("play.example.net".to_string()),
        },
        ranks,
        updated_at: now,
        data: serde_json::Map::new(),
    }
}

/// Owns the active profile and answers configuration requests.
pub struct NetworkConfigManager {
    store: Arc<dyn ProfileStore>,
    bus: Arc<dyn Bus>,
    clock: Arc<dyn Clock>,
    sender_id: String,
    /// Published snapshot. Readers clone the `Arc` and never see a partial
    /// profile.
    active: RwLock<Option<Arc<NetworkProfile>>>,
    /// Serializes apply and refresh.
    write_lock: tokio::sync::Mutex<()>,
}

impl NetworkConfigManager {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        bus: Arc<dyn Bus>,
        clock: Arc<dyn Clock>,
        sender_id: String,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            sender_id,
            active: RwLock::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Startup path: seed an empty catalog with the bundled default and
    /// cache whatever the active pointer references.
    pub async fn initialize(&self) -> Result<(), ProfileError> {
        let _guard = self.write_lock.lock().await;
        if self.store.list().await?.is_empty() {
            let profile = default_profile(self.clock.wall());
            self.store.save(&profile).await?;
            self.store
                .set_active(&ActivePointer {
                    profile_id: profile.profile_id.clone(),
                    tag: profile.tag.clone(),
                    updated_at: profile.updated_at,
                })
                .await?;
            tracing::info!(profile_id = %profile.profile_id, "Seeded empty catalog with the default profile");
            *self.active.write() = Some(Arc::new(profile));
            return Ok(());
        }

        match self.store.active_pointer().await? {
            Some(pointer) => match self.store.load(&pointer.profile_id).await? {
                Some(profile) => {
                    let errors = validate(&profile);
                    if errors.is_empty() {
                        tracing::info!(profile_id = %profile.profile_id, tag = %profile.tag, "Loaded active profile");
                        *self.active.write() = Some(Arc::new(profile));
                    } else {
                        tracing::error!(
                            profile_id = %pointer.profile_id,
                            errors = ?errors,
                            "Active profile fails validation, starting without one"
                        );
                    }
                }
                None => {
                    tracing::warn!(
                        profile_id = %pointer.profile_id,
                        "Active pointer references a missing profile"
                    );
                }
            },
            None => {
                tracing::warn!("Catalog has profiles but no active pointer");
            }
        }
        Ok(())
    }

    /// Catalog summaries with the active marker set.
    pub async fn list_profiles(&self) -> Result<Vec<ProfileSummary>, ProfileError> {
        let active_id = self
            .active
            .read()
            .as_ref()
            .map(|p| p.profile_id.clone());
        let summaries = self.store.list().await?;
        Ok(summaries
            .into_iter()
            .map(|s| ProfileSummary {
                active: Some(&s.profile_id) == active_id.as_ref(),
                profile_id: s.profile_id,
                tag: s.tag,
                updated_at: s.updated_at,
            })
            .collect())
    }

    /// Load, validate, and activate a profile, then broadcast the change.
    ///
    /// The broadcast happens strictly after the snapshot swap: any node that
    /// reacts to it will read the new profile.
    pub async fn apply_profile(&self, profile_id: &str) -> Result<Arc<NetworkProfile>, ProfileError> {
        let _guard = self.write_lock.lock().await;

        let profile = self
            .store
            .load(profile_id)
            .await?
            .ok_or_else(|| ProfileError::NotFound(profile_id.to_string()))?;

        let errors = validate(&profile);
        if !errors.is_empty() {
            tracing::warn!(profile_id, errors = ?errors, "Profile rejected by validation");
            return Err(ProfileError::Validation(errors));
        }

        self.store
            .set_active(&ActivePointer {
                profile_id: profile.profile_id.clone(),
                tag: profile.tag.clone(),
                updated_at: profile.updated_at,
            })
            .await?;

        let profile = Arc::new(profile);
        *self.active.write() = Some(profile.clone());
        crate::metrics::CONFIG_APPLIES.inc();
        tracing::info!(profile_id = %profile.profile_id, tag = %profile.tag, "Profile applied");

        let updated = ConfigUpdated {
            profile_id: profile.profile_id.clone(),
            tag: profile.tag.clone(),
            updated_at: profile.updated_at,
        };
        match Envelope::new(channels::CONFIG_UPDATED, &self.sender_id, &updated) {
            Ok(envelope) => {
                if let Err(e) = self.bus.publish(channels::CONFIG_UPDATED, envelope).await {
                    tracing::warn!(error = %e, "Failed to broadcast profile update");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode profile update broadcast"),
        }

        Ok(profile)
    }

    /// Re-read the catalog. If the active profile still exists and still
    /// validates, the cache is refreshed; on a transient store failure the
    /// previously cached profile remains active.
    pub async fn refresh(&self) -> Result<(), ProfileError> {
        let _guard = self.write_lock.lock().await;

        let pointer = match self.store.active_pointer().await {
            Ok(pointer) => pointer,
            Err(e) => {
                tracing::warn!(error = %e, "Catalog refresh failed, keeping cached profile");
                return Err(e);
            }
        };
        let Some(pointer) = pointer else {
            tracing::warn!("Catalog has no active pointer, keeping cached profile");
            return Ok(());
        };

        match self.store.load(&pointer.profile_id).await {
            Ok(Some(profile)) => {
                let errors = validate(&profile);
                if errors.is_empty() {
                    *self.active.write() = Some(Arc::new(profile));
                    tracing::debug!(profile_id = %pointer.profile_id, "Active profile re-cached");
                } else {
                    tracing::error!(
                        profile_id = %pointer.profile_id,
                        errors = ?errors,
                        "Refreshed profile fails validation, keeping cached profile"
                    );
                }
                Ok(())
            }
            Ok(None) => {
                tracing::warn!(
                    profile_id = %pointer.profile_id,
                    "Active profile vanished from the catalog, keeping cached profile"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Catalog refresh failed, keeping cached profile");
                Err(e)
            }
        }
    }

    /// The cached active profile, or an explicit unavailable result. Never
    /// blocks behind apply or refresh.
    pub fn get_active_profile(&self) -> Result<Arc<NetworkProfile>, ProfileError> {
        self.active
            .read()
            .clone()
            .ok_or(ProfileError::NoActiveProfile)
    }

    /// Answer a `network.config.request`. Specific-profile fetches read the
    /// catalog without activating anything.
    pub async fn handle_request(
        &self,
        request: &crate::bus::messages::ConfigRequest,
    ) -> crate::bus::messages::ConfigResponse {
        use crate::bus::messages::ConfigResponse;

        if request.refresh
            && let Err(e) = self.refresh().await
        {
            tracing::warn!(request_id = %request.request_id, error = %e, "Refresh before answering failed");
        }

        let result = match &request.profile_id {
            Some(profile_id) => match self.store.load(profile_id).await {
                Ok(Some(profile)) => Ok(Arc::new(profile)),
                Ok(None) => Err(ProfileError::NotFound(profile_id.clone())),
                Err(e) => Err(e),
            },
            None => self.get_active_profile(),
        };

        match result {
            Ok(profile) => ConfigResponse {
                request_id: request.request_id.clone(),
                ok: true,
                error: None,
                profile: Some((*profile).clone()),
            },
            Err(e) => ConfigResponse {
                request_id: request.request_id.clone(),
                ok: false,
                error: Some(e.reply_message()),
                profile: None,
            },
        }
    }
}
