//! Randomized client identities

use crate::session::collaborators::{Identity, IdentityProvider, Pacing};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::time::Duration;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

/// Picks a user agent and a pacing window at random for every identity
#[derive(Debug, Clone)]
pub struct RandomIdentity {
    user_agents: Vec<String>,
    /// Bounds for the lower edge of the pacing window, in milliseconds
    pacing_floor_ms: (u64, u64),
    /// Width of the pacing window, in milliseconds
    pacing_spread_ms: u64,
}

impl Default for RandomIdentity {
    fn default() -> Self {
        Self {
            user_agents: USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            pacing_floor_ms: (500, 1500),
            pacing_spread_ms: 1500,
        }
    }
}

impl RandomIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        if !user_agents.is_empty() {
            self.user_agents = user_agents;
        }
        self
    }

    /// Disable pacing
    pub fn without_pacing(mut self) -> Self {
        self.pacing_spread_ms = 0;
        self.pacing_floor_ms = (0, 0);
        self
    }
}

impl IdentityProvider for RandomIdentity {
    fn next_identity(&self) -> Identity {
        let mut rng = rand::rng();
        let user_agent = self
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| USER_AGENTS[0].to_string());

        let (low, high) = self.pacing_floor_ms;
        let pacing = (high > 0).then(|| {
            let floor = rng.random_range(low..=high);
            Pacing {
                min: Duration::from_millis(floor),
                max: Duration::from_millis(floor + self.pacing_spread_ms),
            }
        });

        Identity { user_agent, pacing }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_uses_known_user_agent() {
        let provider = RandomIdentity::new();
        for _ in 0..20 {
            let identity = provider.next_identity();
            assert!(USER_AGENTS.contains(&identity.user_agent.as_str()));
            let pacing = identity.pacing.unwrap();
            assert!(pacing.min >= Duration::from_millis(500));
            assert!(pacing.max > pacing.min);
        }
    }

    #[test]
    fn test_custom_agents_without_pacing() {
        let provider = RandomIdentity::new()
            .with_user_agents(vec!["agent/1.0".to_string()])
            .without_pacing();
        let identity = provider.next_identity();
        assert_eq!(identity.user_agent, "agent/1.0");
        assert!(identity.pacing.is_none());
    }
}
