//! # Floodfill Election
//!
//! Decides periodically whether this router should advertise the floodfill
//! capability.
//!
//! | Condition | Result |
//! |-----------|--------|
//! | `floodfill = "enabled"` / `"disabled"` | forced, no rate limit |
//! | uptime below minimum or capacity class not allowed | not floodfill |
//! | healthy floodfills above MAX | stand down |
//! | healthy floodfills below MIN and well integrated | volunteer |
//! | healthy floodfills below MIN, not well integrated | stand down |
//! | between MIN and MAX | keep current status while well integrated |
//!
//! "Healthy" floodfills published recently, are not failing or unreachable
//! and are not banned. Automatic flips are at least `min_change_interval`
//! apart. Every flip asks the router to republish its own descriptor.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{ElectionConfig, FloodfillMode};
use crate::context::NetDbContext;
use crate::identity::now_ms;
use crate::protocols::{PeerTier, RouterHealth, Transport};

/// Everything the election decision looks at.
#[derive(Clone, Debug, Default)]
pub struct ElectionInputs {
    pub currently_floodfill: bool,
    pub healthy_floodfills: usize,
    pub known_routers: usize,
    pub health: RouterHealth,
}

/// Whether a router in `inputs` should be a floodfill, ignoring rate limits.
pub fn should_be_floodfill(cfg: &ElectionConfig, mode: FloodfillMode, inputs: &ElectionInputs) -> bool {
    match mode {
        FloodfillMode::Enabled => return true,
        FloodfillMode::Disabled => return false,
        FloodfillMode::Auto => {}
    }
    if inputs.health.uptime < cfg.min_uptime {
        return false;
    }
    let capable = inputs
        .health
        .bandwidth_class
        .is_some_and(|c| cfg.capacity_classes.contains(c));
    if !capable {
        return false;
    }

    if inputs.healthy_floodfills > cfg.max_floodfills {
        return false;
    }
    let wanted = inputs.healthy_floodfills < cfg.min_floodfills || inputs.currently_floodfill;
    wanted && is_well_integrated(cfg, inputs)
}

/// Local health checks a volunteer must pass.
pub fn is_well_integrated(cfg: &ElectionConfig, inputs: &ElectionInputs) -> bool {
    let h = &inputs.health;
    h.job_lag <= cfg.max_job_lag
        && inputs.known_routers >= cfg.min_known_routers
        && h.active_peers >= cfg.min_active_peers
        && h.participating_tunnels >= cfg.min_participating_tunnels
        && h.clock_skew <= cfg.max_clock_skew
        && h.reachable_without_introducers
}

pub struct FloodfillMonitor<T: Transport> {
    ctx: Arc<NetDbContext<T>>,
    last_change: Option<Instant>,
}

impl<T: Transport> FloodfillMonitor<T> {
    pub fn new(ctx: Arc<NetDbContext<T>>) -> Self {
        Self { ctx, last_change: None }
    }

    /// Floodfills published within the healthy window that are neither
    /// failing, unreachable nor banned.
    pub fn healthy_floodfill_count(&self) -> usize {
        let ctx = &self.ctx;
        let max_age = ctx.config.election.healthy_publish_age.as_millis() as u64;
        let now = now_ms();
        ctx.selector()
            .select_all_floodfill_participants(&HashSet::new())
            .into_iter()
            .filter(|peer| !ctx.banlist.is_banned(peer))
            .filter(|peer| !matches!(ctx.reliability.tier(peer), PeerTier::Failing | PeerTier::Unreachable))
            .filter(|peer| {
                ctx.data
                    .router_info(peer)
                    .is_some_and(|ri| now.saturating_sub(ri.published) <= max_age)
            })
            .count()
    }

    pub fn inputs(&self) -> ElectionInputs {
        ElectionInputs {
            currently_floodfill: self.ctx.is_floodfill(),
            healthy_floodfills: self.healthy_floodfill_count(),
            known_routers: self.ctx.data.router_count(),
            health: self.ctx.status.health(),
        }
    }

    /// Run one election. Returns the new status when it flipped.
    pub fn evaluate(&mut self) -> Option<bool> {
        let cfg = &self.ctx.config.election;
        let mode = self.ctx.config.floodfill;
        let inputs = self.inputs();
        let wanted = should_be_floodfill(cfg, mode, &inputs);
        if wanted == inputs.currently_floodfill {
            debug!(floodfill = wanted, healthy = inputs.healthy_floodfills, "floodfill status unchanged");
            return None;
        }

        let now = Instant::now();
        if mode == FloodfillMode::Auto {
            if let Some(last) = self.last_change {
                if now.duration_since(last) < cfg.min_change_interval {
                    debug!(wanted, "floodfill flip deferred, changed too recently");
                    return None;
                }
            }
        }

        self.ctx.set_floodfill(wanted);
        self.last_change = Some(now);
        info!(
            floodfill = wanted,
            healthy = inputs.healthy_floodfills,
            known_routers = inputs.known_routers,
            ?mode,
            "floodfill status changed"
        );
        self.ctx.status.republish(wanted);
        Some(wanted)
    }
}

/// Run elections every `election.interval`, starting immediately. The task
/// ends once the context is dropped.
pub fn spawn_floodfill_monitor<T: Transport>(ctx: &Arc<NetDbContext<T>>) -> JoinHandle<()> {
    let weak: Weak<NetDbContext<T>> = Arc::downgrade(ctx);
    let period = ctx.config.election.interval;
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_change = None;
        loop {
            tick.tick().await;
            let Some(ctx) = weak.upgrade() else { break };
            let mut monitor = FloodfillMonitor { ctx, last_change };
            monitor.evaluate();
            last_change = monitor.last_change;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::config::NetDbConfig;
    use crate::context::Collaborators;
    use crate::identity::Identity;
    use crate::messages::NetDbMessage;
    use crate::profiles::StaticRouterStatus;
    use crate::protocols::Route;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _to: &Identity, _message: NetDbMessage, _route: Route) -> Result<()> {
            Ok(())
        }
    }

    fn monitor(mode: FloodfillMode, status: Arc<StaticRouterStatus>) -> FloodfillMonitor<NullTransport> {
        let mut config = NetDbConfig::default();
        config.floodfill = mode;
        config.election.min_known_routers = 0;
        let collab = Collaborators { status, ..Collaborators::in_memory() };
        let ctx = NetDbContext::new(Identity::random(), config, Arc::new(NullTransport), collab);
        FloodfillMonitor::new(Arc::new(ctx))
    }

    fn integrated() -> ElectionInputs {
        ElectionInputs {
            currently_floodfill: false,
            healthy_floodfills: 100,
            known_routers: 2_000,
            health: RouterHealth {
                uptime: Duration::from_secs(3 * 60 * 60),
                bandwidth_class: Some('P'),
                job_lag: Duration::from_millis(5),
                active_peers: 200,
                participating_tunnels: 300,
                clock_skew: Duration::from_secs(1),
                reachable_without_introducers: true,
            },
        }
    }

    #[test]
    fn forced_modes_win() {
        let cfg = ElectionConfig::default();
        let fresh = ElectionInputs::default();
        assert!(should_be_floodfill(&cfg, FloodfillMode::Enabled, &fresh));
        assert!(!should_be_floodfill(&cfg, FloodfillMode::Disabled, &integrated()));
    }

    #[test]
    fn volunteers_when_population_is_low() {
        let cfg = ElectionConfig::default();
        assert!(should_be_floodfill(&cfg, FloodfillMode::Auto, &integrated()));

        let mut young = integrated();
        young.health.uptime = Duration::from_secs(60);
        assert!(!should_be_floodfill(&cfg, FloodfillMode::Auto, &young));

        let mut slow = integrated();
        slow.health.bandwidth_class = Some('L');
        assert!(!should_be_floodfill(&cfg, FloodfillMode::Auto, &slow));
    }

    #[test]
    fn stands_down_when_not_integrated_or_crowded() {
        let cfg = ElectionConfig::default();
        let mut firewalled = integrated();
        firewalled.health.reachable_without_introducers = false;
        assert!(!should_be_floodfill(&cfg, FloodfillMode::Auto, &firewalled));

        let mut crowded = integrated();
        crowded.currently_floodfill = true;
        crowded.healthy_floodfills = cfg.max_floodfills + 1;
        assert!(!should_be_floodfill(&cfg, FloodfillMode::Auto, &crowded));
    }

    #[test]
    fn keeps_status_inside_the_target_range() {
        let cfg = ElectionConfig::default();
        let mut inputs = integrated();
        inputs.healthy_floodfills = (cfg.min_floodfills + cfg.max_floodfills) / 2;
        assert!(!should_be_floodfill(&cfg, FloodfillMode::Auto, &inputs));
        inputs.currently_floodfill = true;
        assert!(should_be_floodfill(&cfg, FloodfillMode::Auto, &inputs));
        inputs.health.clock_skew = Duration::from_secs(60);
        assert!(!should_be_floodfill(&cfg, FloodfillMode::Auto, &inputs));
    }

    #[tokio::test(start_paused = true)]
    async fn automatic_flips_are_rate_limited() {
        let status = Arc::new(StaticRouterStatus::new(integrated().health));
        let mut monitor = monitor(FloodfillMode::Auto, status.clone());
        let min_change = monitor.ctx.config.election.min_change_interval;

        assert_eq!(monitor.evaluate(), Some(true));

        // Now firewalled, so it wants to stand down, but it just flipped.
        status.set_health(RouterHealth {
            reachable_without_introducers: false,
            ..integrated().health
        });
        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        assert_eq!(monitor.evaluate(), None);
        assert!(monitor.ctx.is_floodfill());

        tokio::time::advance(min_change).await;
        assert_eq!(monitor.evaluate(), Some(false));
        assert!(!monitor.ctx.is_floodfill());
        assert_eq!(status.republished(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_modes_ignore_the_flip_rate_limit() {
        let status = Arc::new(StaticRouterStatus::new(ElectionInputs::default().health));
        let mut forced_on = monitor(FloodfillMode::Enabled, status.clone());
        forced_on.last_change = Some(Instant::now());
        assert_eq!(forced_on.evaluate(), Some(true));

        let mut forced_off = monitor(FloodfillMode::Disabled, status.clone());
        forced_off.ctx.set_floodfill(true);
        forced_off.last_change = Some(Instant::now());
        assert_eq!(forced_off.evaluate(), Some(false));

        assert_eq!(status.republished(), vec![true, false]);
    }
}
