use std::collections::HashSet;
use std::sync::Arc;

use stem_rs::descriptor::router_status::RouterStatusEntry;
use tracing::{debug, trace};

use super::{RelayRecord, Role};
use crate::control::event::{Circuit, Hop};
use crate::control::{ControlError, ControlPort};
use crate::geo::{GeoLocation, GeoLocator};
use crate::metrics::Metrics;

/// Turns circuit hops into [`RelayRecord`]s.
///
/// Nothing is cached: every call re-resolves against the control channel and
/// the geolocation database so records reflect the relay's current view.
pub struct Enricher<C, G> {
    control: Arc<C>,
    geo: Arc<G>,
    metrics: Arc<Metrics>,
}

impl<C, G> Clone for Enricher<C, G> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            geo: Arc::clone(&self.geo),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<C: ControlPort, G: GeoLocator> Enricher<C, G> {
    pub fn new(control: Arc<C>, geo: Arc<G>, metrics: Arc<Metrics>) -> Self {
        Self {
            control,
            geo,
            metrics,
        }
    }

    pub fn control(&self) -> &Arc<C> {
        &self.control
    }

    /// Geolocate an arbitrary address, e.g. a stream target.
    pub fn locate(&self, address: &str) -> Option<GeoLocation> {
        self.geo.resolve(address)
    }

    /// Country code the relay itself maps `address` to. Failures and
    /// unmapped addresses are counted and yield `None`.
    pub async fn country(&self, address: &str) -> Option<String> {
        match self.control.country(address).await {
            Ok(Some(code)) => Some(code),
            Ok(None) => {
                self.field_failure("country");
                None
            }
            Err(e) => {
                self.field_failure("country");
                debug!(address, error = %e, "country lookup failed");
                None
            }
        }
    }

    /// Enrich a single hop. Never fails: each lookup that fails leaves only
    /// its own field unknown.
    pub async fn describe(&self, hop: &Hop, role: Role) -> RelayRecord {
        let status = self.router_status(&hop.fingerprint).await;
        self.complete(hop, role, status).await
    }

    /// Enrich every hop of `circuit`, tagging roles by position.
    pub async fn describe_path(&self, circuit: &Circuit) -> Vec<RelayRecord> {
        let len = circuit.path.len();
        let mut records = Vec::with_capacity(len);
        for (index, hop) in circuit.path.iter().enumerate() {
            records.push(self.describe(hop, Role::from_position(index, len)).await);
        }
        records
    }

    /// The current node set: hops of every BUILT circuit, one record per
    /// distinct address.
    ///
    /// Circuits are walked in the order the relay enumerates them and the
    /// first occurrence of an address wins, including its role. Hops whose
    /// address cannot be resolved are left out.
    pub async fn collect(&self) -> Result<Vec<RelayRecord>, ControlError> {
        let circuits = self.control.circuits().await?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut records = Vec::new();

        for circuit in circuits.iter().filter(|c| c.is_built()) {
            let len = circuit.path.len();

            for (index, hop) in circuit.path.iter().enumerate() {
                let Some(status) = self.router_status(&hop.fingerprint).await else {
                    debug!(
                        circuit_id = %circuit.id,
                        fingerprint = %hop.fingerprint,
                        "skipping hop without router status",
                    );
                    continue;
                };

                if !seen.insert(status.address.to_string()) {
                    trace!(address = %status.address, "address already collected");
                    continue;
                }

                let role = Role::from_position(index, len);
                records.push(self.complete(hop, role, Some(status)).await);
            }
        }

        Ok(records)
    }

    async fn router_status(&self, fingerprint: &str) -> Option<RouterStatusEntry> {
        match self.control.network_status(fingerprint).await {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                self.field_failure("router_status");
                debug!(fingerprint, "relay not in consensus");
                None
            }
            Err(e) => {
                self.field_failure("router_status");
                debug!(fingerprint, error = %e, "router status lookup failed");
                None
            }
        }
    }

    async fn complete(&self, hop: &Hop, role: Role, status: Option<RouterStatusEntry>) -> RelayRecord {
        let (address, bandwidth, consensus_nickname) = match status {
            Some(s) => (Some(s.address.to_string()), s.bandwidth, Some(s.nickname)),
            None => (None, None, None),
        };

        if address.is_some() && bandwidth.is_none() {
            self.field_failure("bandwidth");
        }

        let mut location = None;
        let mut country = None;

        if let Some(addr) = address.as_deref() {
            location = self.geo.resolve(addr);
            if location.is_none() {
                self.field_failure("location");
            }

            country = self.country(addr).await;
        }

        RelayRecord {
            fingerprint: hop.fingerprint.clone(),
            nickname: hop.nickname.clone().or(consensus_nickname),
            address,
            country,
            location,
            bandwidth,
            role,
        }
    }

    fn field_failure(&self, field: &str) {
        self.metrics
            .enrichment_failures
            .with_label_values(&[field])
            .inc();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::control::event::CircuitStatus;
    use crate::testing::{circuit, FakeControl, MemoryGeo};

    fn enricher(control: Arc<FakeControl>, geo: MemoryGeo) -> Enricher<FakeControl, MemoryGeo> {
        Enricher::new(control, Arc::new(geo), Arc::new(Metrics::new().unwrap()))
    }

    #[tokio::test]
    async fn test_describe_downgrades_only_failed_fields() {
        let control = Arc::new(FakeControl::new());
        control.add_relay("AAAA", "nickA", "198.51.100.1", Some(5120));
        // No country mapping and no geolocation for the address.

        let record = enricher(control, MemoryGeo::new())
            .describe(&Hop::new("AAAA", Some("nickA")), Role::Entry)
            .await;

        assert_eq!(record.address.as_deref(), Some("198.51.100.1"));
        assert_eq!(record.bandwidth, Some(5120));
        assert_eq!(record.country, None);
        assert_eq!(record.location, None);
        assert_eq!(record.role, Role::Entry);
    }

    #[tokio::test]
    async fn test_describe_unknown_relay_keeps_identity() {
        let control = Arc::new(FakeControl::new());

        let record = enricher(control, MemoryGeo::new())
            .describe(&Hop::new("FFFF", Some("ghost")), Role::Exit)
            .await;

        assert_eq!(record.fingerprint, "FFFF");
        assert_eq!(record.nickname.as_deref(), Some("ghost"));
        assert_eq!(record.address, None);
        assert_eq!(record.bandwidth, None);
    }

    #[tokio::test]
    async fn test_describe_survives_control_failure() {
        let control = Arc::new(FakeControl::new());
        control.add_relay("AAAA", "nickA", "198.51.100.1", Some(100));
        control.set_country("198.51.100.1", "de");
        control.fail_country(true);

        let geo = MemoryGeo::new().with("198.51.100.1", "DE", 50.1, 8.6);
        let record = enricher(control, geo)
            .describe(&Hop::new("AAAA", None), Role::Middle)
            .await;

        assert_eq!(record.country, None);
        assert_eq!(record.latitude(), Some(50.1));
        assert_eq!(record.nickname.as_deref(), Some("nickA"));
    }

    #[tokio::test]
    async fn test_collect_skips_circuits_that_are_not_built() {
        let control = Arc::new(FakeControl::new());
        control.add_relay("AAAA", "a", "198.51.100.1", None);
        control.add_relay("BBBB", "b", "198.51.100.2", None);

        let mut launched = circuit("7", &[("BBBB", "b")]);
        launched.status = CircuitStatus::Extended;
        control.set_circuits(vec![circuit("5", &[("AAAA", "a")]), launched]);

        let records = enricher(control, MemoryGeo::new()).collect().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fingerprint, "AAAA");
        assert_eq!(records[0].role, Role::Exit);
    }

    #[tokio::test]
    async fn test_collect_first_seen_address_wins() {
        let control = Arc::new(FakeControl::new());
        control.add_relay("AAAA", "a", "198.51.100.1", None);
        control.add_relay("BBBB", "b", "198.51.100.2", None);
        control.add_relay("CCCC", "c", "198.51.100.3", None);
        // Same address as AAAA under a different identity.
        control.add_relay("DDDD", "d", "198.51.100.1", None);

        control.set_circuits(vec![
            circuit("1", &[("AAAA", "a"), ("BBBB", "b"), ("CCCC", "c")]),
            circuit("2", &[("CCCC", "c"), ("DDDD", "d"), ("BBBB", "b")]),
        ]);

        let records = enricher(control, MemoryGeo::new()).collect().await.unwrap();
        let fingerprints: Vec<&str> = records.iter().map(|r| r.fingerprint.as_str()).collect();
        assert_eq!(fingerprints, vec!["AAAA", "BBBB", "CCCC"]);
        assert_eq!(records[2].role, Role::Exit);

        let addresses: HashSet<&str> = records
            .iter()
            .filter_map(|r| r.address.as_deref())
            .collect();
        assert_eq!(addresses.len(), records.len());
    }

    #[tokio::test]
    async fn test_collect_skips_hops_without_router_status() {
        let control = Arc::new(FakeControl::new());
        control.add_relay("AAAA", "a", "198.51.100.1", None);
        control.set_circuits(vec![circuit("1", &[("AAAA", "a"), ("EEEE", "e")])]);

        let records = enricher(control, MemoryGeo::new()).collect().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, Role::Entry);
    }

    #[tokio::test]
    async fn test_collect_propagates_circuit_listing_failure() {
        let control = Arc::new(FakeControl::new());
        control.fail_circuits(true);

        let err = enricher(control, MemoryGeo::new()).collect().await.unwrap_err();
        assert!(err.is_connection());
    }
}
