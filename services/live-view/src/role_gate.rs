//! Role-gated projection
//!
//! Turns the aggregate and history of a view context into what a caller of a
//! given role may see. Employees never receive backend document ids or the
//! record-management capability; admins receive the unfiltered projection.
//! Inputs are borrowed and never modified.

use serde::{Deserialize, Serialize};
use types::ids::SnapshotId;
use types::session::{Capabilities, Role, Session};
use types::snapshot::Timestamp;

use crate::aggregator::{aggregate, AggregateView, ChartSeries};
use crate::config::{ChartConfig, ViewConfig};
use crate::history::HistoryEntry;

/// Aggregate as presented to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentedAggregate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<SnapshotId>,
    pub total_units: i64,
    pub distinct_categories: usize,
    pub last_updated: Timestamp,
    pub chart_series: ChartSeries,
    pub categories: Vec<(String, i64)>,
    pub malformed: bool,
}

/// One history row as presented to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentedEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<SnapshotId>,
    /// Abbreviated document id for compact listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    pub timestamp: Timestamp,
    pub total_units: i64,
    pub distinct_categories: usize,
    pub categories: Vec<(String, i64)>,
    pub freshest: bool,
    pub malformed: bool,
}

/// Role-filtered view of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentedView {
    pub capabilities: Capabilities,
    pub aggregate: Option<PresentedAggregate>,
    pub history: Vec<PresentedEntry>,
}

impl PresentedView {
    /// Whether any administrative field is present.
    pub fn exposes_admin_fields(&self) -> bool {
        self.capabilities.manage_records
            || self.capabilities.view_document_ids
            || self
                .aggregate
                .as_ref()
                .map(|a| a.document_id.is_some())
                .unwrap_or(false)
            || self
                .history
                .iter()
                .any(|e| e.document_id.is_some() || e.short_id.is_some())
    }
}

/// Capability filter between derived state and the presentation layer.
#[derive(Debug, Clone)]
pub struct RoleGate {
    chart: ChartConfig,
    short_id_chars: usize,
}

impl RoleGate {
    pub fn new(chart: ChartConfig, short_id_chars: usize) -> Self {
        Self {
            chart,
            short_id_chars,
        }
    }

    pub fn from_config(config: &ViewConfig) -> Self {
        Self::new(config.chart.clone(), config.short_id_chars)
    }

    /// Project for the session's role.
    pub fn view(
        &self,
        aggregate: Option<&AggregateView>,
        history: &[HistoryEntry],
        session: &Session,
    ) -> PresentedView {
        self.project(aggregate, history, session.role.capabilities())
    }

    /// Projection with every field exposed.
    pub fn unfiltered(&self, aggregate: Option<&AggregateView>, history: &[HistoryEntry]) -> PresentedView {
        self.project(aggregate, history, Role::Admin.capabilities())
    }

    fn project(
        &self,
        view: Option<&AggregateView>,
        history: &[HistoryEntry],
        capabilities: Capabilities,
    ) -> PresentedView {
        let show_ids = capabilities.view_document_ids;

        let presented = view.map(|v| PresentedAggregate {
            document_id: show_ids.then(|| v.source_id.clone()),
            total_units: v.total_units,
            distinct_categories: v.distinct_categories,
            last_updated: v.last_updated.clone(),
            chart_series: v.chart_series.clone(),
            categories: v.categories.clone(),
            malformed: v.malformed,
        });

        let history = history
            .iter()
            .map(|entry| {
                let derived = aggregate(&entry.snapshot, &self.chart);
                let id = entry.snapshot.id();
                PresentedEntry {
                    document_id: show_ids.then(|| id.clone()),
                    short_id: show_ids.then(|| id.abbreviated(self.short_id_chars, &self.chart.ellipsis)),
                    timestamp: derived.last_updated,
                    total_units: derived.total_units,
                    distinct_categories: derived.distinct_categories,
                    categories: derived.categories,
                    freshest: entry.freshest,
                    malformed: derived.malformed,
                }
            })
            .collect();

        PresentedView {
            capabilities,
            aggregate: presented,
            history,
        }
    }
}

impl Default for RoleGate {
    fn default() -> Self {
        Self::from_config(&ViewConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryWindow;
    use types::session::{Identity, Profile};
    use types::snapshot::{Products, Snapshot};

    fn fixture() -> (AggregateView, Vec<HistoryEntry>) {
        let mut window = HistoryWindow::with_defaults();
        window.push(Snapshot::new(
            "older-document-id",
            1i64,
            Products::from_pairs([("Milk", 1)]),
        ));
        window.push(Snapshot::new(
            "Xk2p9QmZ0aB7cD4eF",
            2i64,
            Products::from_pairs([("Milk", 3), ("Bread", 2)]),
        ));
        let head = aggregate(window.head().unwrap(), &ChartConfig::default());
        (head, window.entries())
    }

    fn admin() -> Session {
        let identity = Identity::new("a1", None);
        Session::from_profile(
            &identity,
            &Profile {
                role: Some("admin".to_string()),
                ..Profile::default()
            },
        )
    }

    #[test]
    fn test_employee_view_has_no_admin_fields() {
        let gate = RoleGate::default();
        let (head, history) = fixture();
        let view = gate.view(Some(&head), &history, &Session::anonymous());

        assert!(!view.exposes_admin_fields());
        assert_eq!(view.aggregate.as_ref().unwrap().total_units, 5);
        assert_eq!(view.history.len(), 2);

        let json = serde_json::to_value(&view).unwrap();
        let aggregate = json["aggregate"].as_object().unwrap();
        assert!(!aggregate.contains_key("document_id"));
        for entry in json["history"].as_array().unwrap() {
            let entry = entry.as_object().unwrap();
            assert!(!entry.contains_key("document_id"));
            assert!(!entry.contains_key("short_id"));
        }
        assert!(!json.to_string().contains("Xk2p9Qm"));
    }

    #[test]
    fn test_admin_view_equals_unfiltered() {
        let gate = RoleGate::default();
        let (head, history) = fixture();
        let view = gate.view(Some(&head), &history, &admin());

        assert_eq!(view, gate.unfiltered(Some(&head), &history));
        assert!(view.capabilities.manage_records);
        assert_eq!(view.history[0].short_id.as_deref(), Some("Xk2p9QmZ0aB7..."));
        assert_eq!(
            view.aggregate.unwrap().document_id.unwrap().as_str(),
            "Xk2p9QmZ0aB7cD4eF"
        );
    }

    #[test]
    fn test_unknown_role_is_employee() {
        let gate = RoleGate::default();
        let (head, history) = fixture();
        let identity = Identity::new("u9", None);
        let session = Session::from_profile(
            &identity,
            &Profile {
                role: Some("superuser".to_string()),
                ..Profile::default()
            },
        );
        assert!(!gate.view(Some(&head), &history, &session).exposes_admin_fields());
    }

    #[test]
    fn test_inputs_are_not_modified() {
        let gate = RoleGate::default();
        let (head, history) = fixture();
        let before = (head.clone(), history.clone());
        gate.view(Some(&head), &history, &Session::anonymous());
        gate.view(Some(&head), &history, &admin());
        assert_eq!((head, history), before);
    }

    #[test]
    fn test_empty_context() {
        let gate = RoleGate::default();
        let view = gate.view(None, &[], &admin());
        assert!(view.aggregate.is_none());
        assert!(view.history.is_empty());
    }

    #[test]
    fn test_history_entries_keep_freshest_flag() {
        let gate = RoleGate::default();
        let (head, history) = fixture();
        let view = gate.view(Some(&head), &history, &Session::anonymous());
        assert!(view.history[0].freshest);
        assert!(!view.history[1].freshest);
        assert_eq!(view.history[1].total_units, 1);
    }
}
