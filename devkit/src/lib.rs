/*!
# Fleet DevKit - Backend simulé pour tests de l'émulateur

Bibliothèque facilitant les tests de l'émulateur de flotte avec:
- Backend HTTP simulé (registre, dernière métrique, collecteur)
- Payloads JSON au format du backend
- Harness d'expectations sur les requêtes reçues
*/

pub mod mock_backend;
pub mod test_utils;

pub use mock_backend::{BackendPayloads, MockBackend, RecordedMetric, Route};
pub use test_utils::TestHarness;
