/*!
Test Harness pour l'émulateur de flotte

Facilite l'écriture de tests de bout en bout avec:
- Setup automatique du backend simulé
- Expectations sur le nombre de requêtes par route
- Attente bornée d'une condition sur le backend
*/

use crate::mock_backend::{MockBackend, Route};
use anyhow::Result;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Harness de test complet autour d'un `MockBackend`
pub struct TestHarness {
    pub backend: MockBackend,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    route: Route,
    expected_count: usize,
}

impl TestHarness {
    /// Démarre un backend simulé neuf
    pub async fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        Ok(Self {
            backend: MockBackend::start().await?,
            expectations: Vec::new(),
        })
    }

    /// Ajoute une expectation: on s'attend à exactement N requêtes sur une route
    pub fn expect_requests(&mut self, route: Route, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            route,
            expected_count: count,
        });
        self
    }

    /// Attend qu'une condition sur le backend devienne vraie (temps réel)
    pub async fn wait_until<F>(&self, timeout_ms: u64, condition: F) -> bool
    where
        F: Fn(&MockBackend) -> bool,
    {
        let start = Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if condition(&self.backend) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        log::warn!("⏰ Timeout after {}ms waiting for backend condition", timeout_ms);
        condition(&self.backend)
    }

    /// Vérifie toutes les expectations configurées
    pub fn verify_expectations(&self) -> Result<()> {
        log::info!("🔍 Verifying {} expectations...", self.expectations.len());

        for expectation in &self.expectations {
            let actual_count = self.backend.request_count(expectation.route);

            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for {:?}: expected {} requests, got {}",
                    expectation.route,
                    expectation.expected_count,
                    actual_count
                );
            }

            log::info!("✅ {:?}: {} requests as expected", expectation.route, actual_count);
        }

        Ok(())
    }

    /// Stats sur les requêtes reçues
    pub fn get_stats(&self) -> RequestStats {
        let route_counts = [Route::Registry, Route::LatestMetric, Route::PostMetric, Route::DeviceOff]
            .into_iter()
            .map(|route| (route, self.backend.request_count(route)))
            .collect::<HashMap<_, _>>();

        RequestStats {
            total_requests: route_counts.values().sum(),
            route_counts,
        }
    }

    /// Reset le harness pour un nouveau scénario
    pub fn reset(&mut self) {
        self.backend.clear();
        self.expectations.clear();
        log::info!("🧹 Test harness reset");
    }
}

#[derive(Debug)]
pub struct RequestStats {
    pub total_requests: usize,
    pub route_counts: HashMap<Route, usize>,
}
