//! Promotion controller: applies the confirmation state machine against the
//! persisted champion, ledger, and watermarks.
//!
//! Write order is watermarks, then ledger, then `champion.json`, then the
//! `champion_score` scalar. A crash between writes can leave the ledger ahead
//! of the champion (the next confirmation of that hash promotes it again) or
//! a stale scalar (startup repair rewrites it from `champion.json`), but never
//! a champion without its ledger entry.

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::promotion::{
    PromotionDecision, PromotionLedger, PromotionRequest, decide, promoted_champion,
    update_watermarks,
};
use crate::core::types::{Champion, Watermarks};
use crate::io::documents::ChampionScore;
use crate::io::store::StateStore;

/// What one promotion attempt did.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionOutcome {
    pub decision: PromotionDecision,
    pub champion_before: Champion,
    pub champion_after: Champion,
    pub watermark_moved: bool,
}

/// The only writer of `champion.json`, `champion_score`, the ledger, and the watermarks.
pub struct PromotionController<'a> {
    store: &'a StateStore,
    required: u32,
}

impl<'a> PromotionController<'a> {
    pub fn new(store: &'a StateStore, required: u32) -> Self {
        Self { store, required }
    }

    #[instrument(skip_all, fields(iteration = request.iteration, hash = %request.content_hash))]
    pub fn maybe_promote(&self, request: &PromotionRequest) -> Result<PromotionOutcome> {
        let champion_before = self.store.read::<Champion>();

        let mut watermarks = self.store.read::<Watermarks>();
        let watermark_moved = update_watermarks(&mut watermarks, request);
        if watermark_moved {
            debug!(
                effective = ?watermarks.best_effective_score,
                raw = ?watermarks.best_raw_score,
                "watermarks raised"
            );
            self.store.write(&watermarks)?;
        }

        let mut ledger = self.store.read::<PromotionLedger>();
        let before = ledger.clone();
        let decision = decide(&mut ledger, &champion_before, request, self.required);
        if ledger != before {
            self.store.write(&ledger)?;
        }

        let champion_after = if decision.is_promoted() {
            let champion = promoted_champion(request);
            self.store.write(&champion)?;
            self.store.write(&ChampionScore(champion.effective_score))?;
            info!(
                from = ?champion_before.effective_score,
                to = request.effective_score,
                "champion promoted"
            );
            champion
        } else {
            debug!(?decision, "champion unchanged");
            champion_before.clone()
        };

        Ok(PromotionOutcome {
            decision,
            champion_before,
            champion_after,
            watermark_moved,
        })
    }
}
