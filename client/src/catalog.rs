//! Event discovery and the cached event list.
//!
//! The contract has no "list events" query, so discovery reads ids 1, 2, 3...
//! until a zeroed record comes back or the configured ceiling is hit.

use async_stream::stream;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use ticket_api::{EventId, EventRecord};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::gateway::ContractGateway;

pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<EventRecord>> + Send + 'a>>;

/// Lazily reads events in id order. Ends at the first zeroed record, at
/// `ceiling`, or right after yielding a read error. Every call starts over at 1.
pub fn event_scan(gateway: &ContractGateway, ceiling: u64) -> EventStream<'_> {
    Box::pin(stream! {
        for id in 1..=ceiling {
            match gateway.get_event(id).await {
                Ok(event) if !event.exists() => {
                    debug!("Event scan ended at id {}", id);
                    break;
                }
                Ok(event) => yield Ok(event),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

/// Result of one discovery pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogLoad {
    /// Active events, in id order.
    pub events: Vec<EventRecord>,
    /// Records read before the scan stopped, paused events included.
    pub scanned: usize,
    /// Set when a read failed part-way; `events` still holds what came before.
    pub error: Option<ClientError>,
}

#[derive(Debug)]
struct SearchMemo {
    term: String,
    revision: u64,
    results: Vec<EventRecord>,
}

#[derive(Debug, Default)]
struct CatalogState {
    all: Vec<EventRecord>,
    loaded: bool,
    // Bumped by invalidate(); a scan started before it is dropped.
    generation: u64,
    // Bumped whenever `all` changes.
    revision: u64,
    // Scan numbering; a scan older than the last applied one is dropped.
    issued: u64,
    applied: u64,
    memo: Option<SearchMemo>,
}

pub struct EventCatalog {
    ceiling: u64,
    state: Mutex<CatalogState>,
}

impl EventCatalog {
    pub fn new(ceiling: u64) -> Self {
        EventCatalog {
            ceiling,
            state: Mutex::new(CatalogState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Scans and replaces the cached list, unless a scan started later has
    /// already replaced it.
    pub async fn load(&self, gateway: &ContractGateway) -> CatalogLoad {
        let (generation, sequence) = {
            let mut state = self.lock();
            state.issued += 1;
            (state.generation, state.issued)
        };
        let mut scan = event_scan(gateway, self.ceiling);
        let mut all = Vec::new();
        let mut error = None;
        while let Some(item) = scan.next().await {
            match item {
                Ok(event) => all.push(event),
                Err(e) => {
                    warn!(
                        "Event scan stopped after {} events: {}",
                        all.len(),
                        e
                    );
                    error = Some(e);
                }
            }
        }
        if error.is_none() && all.len() as u64 == self.ceiling {
            warn!(
                "Event scan reached the ceiling of {}; later events are not listed",
                self.ceiling
            );
        }

        let scanned = all.len();
        let events: Vec<EventRecord> = all.iter().filter(|e| e.is_active).cloned().collect();

        let mut state = self.lock();
        if state.generation != generation {
            debug!("Discarding catalog scan from a previous session");
        } else if sequence < state.applied {
            debug!("Discarding catalog scan overtaken by a newer one");
        } else {
            state.all = all;
            state.loaded = true;
            state.revision += 1;
            state.applied = sequence;
            info!("Catalog loaded: {} active of {} events", events.len(), scanned);
        }
        CatalogLoad {
            events,
            scanned,
            error,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    /// Events visible to buyers.
    pub fn active(&self) -> Vec<EventRecord> {
        self.lock()
            .all
            .iter()
            .filter(|e| e.is_active)
            .cloned()
            .collect()
    }

    /// Every scanned event, paused ones included, for the organizer panel.
    pub fn all(&self) -> Vec<EventRecord> {
        self.lock().all.clone()
    }

    pub fn get(&self, id: EventId) -> Option<EventRecord> {
        self.lock().all.iter().find(|e| e.id == id).cloned()
    }

    /// Case-insensitive substring match on active event names. Only touches
    /// the cached list.
    pub fn search(&self, term: &str) -> Vec<EventRecord> {
        let needle = term.trim().to_lowercase();
        let mut state = self.lock();
        let revision = state.revision;
        if let Some(memo) = &state.memo {
            if memo.term == needle && memo.revision == revision {
                return memo.results.clone();
            }
        }
        let results: Vec<EventRecord> = state
            .all
            .iter()
            .filter(|e| e.is_active && e.name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        state.memo = Some(SearchMemo {
            term: needle,
            revision,
            results: results.clone(),
        });
        results
    }

    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.all.clear();
        state.loaded = false;
        state.memo = None;
        state.generation += 1;
        state.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeLedger;
    use std::sync::Arc;
    use ticket_api::Wei;

    fn gateway(fake: &Arc<FakeLedger>) -> ContractGateway {
        ContractGateway::new(fake.clone(), fake.clone())
    }

    #[tokio::test]
    async fn scan_stops_at_the_first_zeroed_record() {
        let fake = FakeLedger::new();
        fake.add_event("Jazz Night", Wei::new(1000), true);
        fake.add_event("Rock Fest", Wei::new(2000), false);
        fake.add_event("Opera Gala", Wei::new(3000), true);

        let catalog = EventCatalog::new(20);
        let load = catalog.load(&gateway(&fake)).await;
        assert_eq!(load.scanned, 3);
        assert_eq!(load.error, None);
        assert_eq!(
            load.events.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert!(catalog.all().iter().all(|e| e.id != 0));
        assert_eq!(catalog.all().len(), 3);
        assert_eq!(fake.event_reads(), 4);
    }

    #[tokio::test]
    async fn ceiling_bounds_the_scan() {
        let fake = FakeLedger::new();
        for i in 0..8 {
            fake.add_event(&format!("Show {}", i), Wei::new(1), true);
        }
        let catalog = EventCatalog::new(5);
        let load = catalog.load(&gateway(&fake)).await;
        assert_eq!(load.scanned, 5);
        assert_eq!(fake.event_reads(), 5);
    }

    #[tokio::test]
    async fn failed_read_keeps_the_partial_catalog() {
        let fake = FakeLedger::new();
        for i in 0..4 {
            fake.add_event(&format!("Show {}", i), Wei::new(1), true);
        }
        fake.fail_event_read(3);
        let catalog = EventCatalog::new(20);
        let load = catalog.load(&gateway(&fake)).await;
        assert_eq!(load.events.len(), 2);
        assert!(matches!(load.error, Some(ClientError::ReadFailed(_))));
        assert_eq!(catalog.active().len(), 2);
    }

    #[tokio::test]
    async fn empty_catalog_is_not_an_error() {
        let fake = FakeLedger::new();
        let catalog = EventCatalog::new(20);
        let load = catalog.load(&gateway(&fake)).await;
        assert!(load.events.is_empty());
        assert_eq!(load.error, None);
        assert!(catalog.is_loaded());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_tracks_reloads() {
        let fake = FakeLedger::new();
        fake.add_event("Jazz Night", Wei::new(1000), true);
        fake.add_event("Late Jazz", Wei::new(1000), true);
        fake.add_event("Rock Fest", Wei::new(1000), true);
        let catalog = EventCatalog::new(20);
        let gw = gateway(&fake);
        catalog.load(&gw).await;

        assert_eq!(catalog.search("JAZZ").len(), 2);
        assert_eq!(catalog.search("").len(), 3);
        assert!(catalog.search("opera").is_empty());

        fake.add_event("Opera Gala", Wei::new(1000), true);
        assert!(catalog.search("opera").is_empty());
        catalog.load(&gw).await;
        assert_eq!(catalog.search("opera").len(), 1);
        assert_eq!(catalog.get(4).unwrap().name, "Opera Gala");
    }

    #[tokio::test]
    async fn invalidate_clears_the_view() {
        let fake = FakeLedger::new();
        fake.add_event("Jazz Night", Wei::new(1000), true);
        let catalog = EventCatalog::new(20);
        catalog.load(&gateway(&fake)).await;
        catalog.invalidate();
        assert!(!catalog.is_loaded());
        assert!(catalog.search("jazz").is_empty());
    }

    #[tokio::test]
    async fn older_scan_cannot_overwrite_a_newer_one() {
        let fake = FakeLedger::new();
        fake.add_event("Jazz Night", Wei::new(1000), true);
        let gw = Arc::new(gateway(&fake));
        let catalog = Arc::new(EventCatalog::new(20));

        fake.stall_next_event_read();
        let older = {
            let (gw, catalog) = (gw.clone(), catalog.clone());
            tokio::spawn(async move { catalog.load(&gw).await })
        };
        while fake.stalled_reads() == 0 {
            tokio::task::yield_now().await;
        }

        fake.set_event_active(1, false);
        let newer = catalog.load(&gw).await;
        assert!(newer.events.is_empty());
        assert_eq!(catalog.all().len(), 1);
        assert!(catalog.active().is_empty());

        fake.release_stalled_reads();
        let stale = older.await.unwrap();
        assert_eq!(stale.events.len(), 1);
        assert!(catalog.active().is_empty());
        assert!(!catalog.get(1).unwrap().is_active);
    }
}
