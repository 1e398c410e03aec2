use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::policy::validate_settings;
use super::{Engine, EngineError, WalCommand};

/// Owner-only operations require the restaurant to still exist (not archived).
fn require_owner(rs: &RestaurantState, actor: &Ulid) -> Result<(), EngineError> {
    if rs.archived {
        return Err(EngineError::NotFound(rs.id));
    }
    if rs.owner_id != *actor {
        return Err(EngineError::AccessDenied);
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 || capacity > MAX_TABLE_CAPACITY {
        return Err(EngineError::LimitExceeded("table capacity out of range"));
    }
    Ok(())
}

impl Engine {
    pub async fn register_restaurant(
        &self,
        id: Ulid,
        owner_id: Ulid,
        name: String,
        settings: RestaurantSettings,
    ) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        if self.state.len() >= MAX_RESTAURANTS {
            return Err(EngineError::LimitExceeded("too many restaurants"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("restaurant name too long"));
        }
        validate_settings(&settings)?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RestaurantRegistered {
            id,
            owner_id,
            name: name.clone(),
            settings,
        };
        self.wal_append(&event).await?;
        let rs = RestaurantState::new(id, owner_id, name, settings);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        tracing::info!("restaurant {id} registered by {owner_id}");
        Ok(())
    }

    /// Marks the restaurant verified. Verification itself is done by an
    /// administrator outside the engine.
    pub async fn verify_restaurant(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.restaurant_write(&id).await?;
        if guard.archived {
            return Err(EngineError::NotFound(id));
        }
        if guard.verified {
            return Ok(());
        }
        self.persist_and_apply(&mut guard, &Event::RestaurantVerified { id })
            .await
    }

    pub async fn update_settings(
        &self,
        id: Ulid,
        actor: Ulid,
        settings: RestaurantSettings,
    ) -> Result<(), EngineError> {
        validate_settings(&settings)?;
        let mut guard = self.restaurant_write(&id).await?;
        require_owner(&guard, &actor)?;
        self.persist_and_apply(&mut guard, &Event::SettingsUpdated { id, settings })
            .await
    }

    /// Soft-deletes the restaurant and every table in it. Existing visits are kept.
    pub async fn archive_restaurant(&self, id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let mut guard = self.restaurant_write(&id).await?;
        require_owner(&guard, &actor)?;
        self.persist_and_apply(&mut guard, &Event::RestaurantArchived { id })
            .await?;
        self.notify.remove(&id);
        tracing::info!("restaurant {id} archived");
        Ok(())
    }

    // ── Staff ────────────────────────────────────────────────

    pub async fn hire_employee(
        &self,
        restaurant_id: Ulid,
        actor: Ulid,
        user_id: Ulid,
        hall_access: bool,
    ) -> Result<(), EngineError> {
        let mut guard = self.restaurant_write(&restaurant_id).await?;
        require_owner(&guard, &actor)?;
        if guard.employees.contains_key(&user_id) {
            return Err(EngineError::AlreadyExists(user_id));
        }
        if guard.employees.len() >= MAX_EMPLOYEES_PER_RESTAURANT {
            return Err(EngineError::LimitExceeded("too many employees"));
        }
        let event = Event::EmployeeHired {
            restaurant_id,
            user_id,
            hall_access,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn fire_employee(
        &self,
        restaurant_id: Ulid,
        actor: Ulid,
        user_id: Ulid,
    ) -> Result<(), EngineError> {
        let mut guard = self.restaurant_write(&restaurant_id).await?;
        require_owner(&guard, &actor)?;
        if !guard.employees.contains_key(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        let event = Event::EmployeeFired {
            restaurant_id,
            user_id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// The owner may change anyone's duty flag; employees only their own.
    pub async fn set_on_duty(
        &self,
        restaurant_id: Ulid,
        actor: Ulid,
        user_id: Ulid,
        on_duty: bool,
    ) -> Result<(), EngineError> {
        let mut guard = self.restaurant_write(&restaurant_id).await?;
        if guard.archived {
            return Err(EngineError::NotFound(restaurant_id));
        }
        if actor != guard.owner_id && actor != user_id {
            return Err(EngineError::AccessDenied);
        }
        if !guard.employees.contains_key(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        let event = Event::DutyChanged {
            restaurant_id,
            user_id,
            on_duty,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Tables ───────────────────────────────────────────────

    pub async fn add_table(
        &self,
        restaurant_id: Ulid,
        actor: Ulid,
        table_id: TableId,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_capacity(capacity)?;
        let mut guard = self.restaurant_write(&restaurant_id).await?;
        require_owner(&guard, &actor)?;
        // Removed tables keep their id so past visits still resolve.
        if guard.tables.contains_key(&table_id) {
            return Err(EngineError::TableAlreadyExists(table_id));
        }
        if guard.tables.len() >= MAX_TABLES_PER_RESTAURANT {
            return Err(EngineError::LimitExceeded("too many tables"));
        }
        let event = Event::TableAdded {
            restaurant_id,
            table_id,
            capacity,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn update_table_capacity(
        &self,
        restaurant_id: Ulid,
        actor: Ulid,
        table_id: TableId,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_capacity(capacity)?;
        let mut guard = self.restaurant_write(&restaurant_id).await?;
        require_owner(&guard, &actor)?;
        if guard.active_table(table_id).is_none() {
            return Err(EngineError::TableNotFound {
                restaurant_id,
                table_id,
            });
        }
        let event = Event::TableCapacityChanged {
            restaurant_id,
            table_id,
            capacity,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_table(
        &self,
        restaurant_id: Ulid,
        actor: Ulid,
        table_id: TableId,
    ) -> Result<(), EngineError> {
        let mut guard = self.restaurant_write(&restaurant_id).await?;
        require_owner(&guard, &actor)?;
        if guard.active_table(table_id).is_none() {
            return Err(EngineError::TableNotFound {
                restaurant_id,
                table_id,
            });
        }
        let event = Event::TableRemoved {
            restaurant_id,
            table_id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        let mut events = Vec::new();
        let mut restaurants: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        restaurants.sort_by_key(|(id, _)| *id);

        // Registration appends under the registry lock and every other mutation
        // under its restaurant's write lock, so holding both until the swap keeps
        // the snapshot consistent with the log.
        let mut guards = Vec::with_capacity(restaurants.len());
        for (_, rs) in restaurants {
            guards.push(rs.read_owned().await);
        }

        for guard in &guards {
            events.push(Event::RestaurantRegistered {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
                settings: guard.settings,
            });
            if guard.verified {
                events.push(Event::RestaurantVerified { id: guard.id });
            }
            let mut staff: Vec<_> = guard.employees.iter().collect();
            staff.sort_by_key(|(id, _)| **id);
            for (user_id, employment) in staff {
                events.push(Event::EmployeeHired {
                    restaurant_id: guard.id,
                    user_id: *user_id,
                    hall_access: employment.hall_access,
                });
                if employment.on_duty {
                    events.push(Event::DutyChanged {
                        restaurant_id: guard.id,
                        user_id: *user_id,
                        on_duty: true,
                    });
                }
            }
            for table in guard.tables.values() {
                events.push(Event::TableAdded {
                    restaurant_id: guard.id,
                    table_id: table.id,
                    capacity: table.capacity,
                });
                if !table.active && !guard.archived {
                    events.push(Event::TableRemoved {
                        restaurant_id: guard.id,
                        table_id: table.id,
                    });
                }
            }
            if guard.archived {
                events.push(Event::RestaurantArchived { id: guard.id });
            }
            let mut visits: Vec<&Visit> = guard.visits.values().collect();
            visits.sort_by_key(|v| v.id);
            for visit in visits {
                events.push(Event::VisitCreated {
                    visit: visit.clone(),
                });
            }
        }

        let event_count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        tracing::info!("WAL compacted to {event_count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
