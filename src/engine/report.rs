use crate::model::*;

use super::conflict::validate_window;
use super::store::AllocationStore;
use super::EngineError;

/// Round to 2 decimal places, half away from zero.
pub fn round_hours(hours: f64) -> f64 {
    (hours * 100.0).round() / 100.0
}

/// One report row: occupied hours clipped to `window`, plus events starting at
/// or after `now`. The upcoming list ignores `window` entirely.
pub fn utilization_row(resource: Resource, events: &[Event], window: &Span, now: Ms) -> UtilizationRow {
    let total: f64 = events.iter().map(|e| e.span.overlap_hours(window)).sum();

    let mut upcoming: Vec<Event> = events
        .iter()
        .filter(|e| e.span.start >= now)
        .cloned()
        .collect();
    upcoming.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));

    UtilizationRow {
        resource,
        total_hours: round_hours(total),
        upcoming,
    }
}

/// Per-resource utilization over `[range_start, range_end)`, in store order.
pub async fn build_report<S: AllocationStore + ?Sized>(
    store: &S,
    range_start: Ms,
    range_end: Ms,
    now: Ms,
) -> Result<Vec<UtilizationRow>, EngineError> {
    let window = validate_window(range_start, range_end)?;
    Ok(store
        .all_resources_with_allocations()
        .await?
        .into_iter()
        .map(|(resource, events)| utilization_row(resource, &events, &window, now))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Snapshot;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn event(id: EventId, start: Ms, end: Ms) -> Event {
        Event {
            id,
            title: format!("e{id}"),
            span: Span::new(start, end),
            description: String::new(),
        }
    }

    fn room(id: ResourceId) -> Resource {
        Resource {
            id,
            name: format!("Room {id}"),
            kind: "room".into(),
        }
    }

    fn back_to_back() -> Snapshot {
        Snapshot::new(vec![(room(1), vec![event(1, 8 * H, 9 * H), event(2, 9 * H, 10 * H)])])
    }

    #[tokio::test]
    async fn full_window() {
        let rows = build_report(&back_to_back(), 8 * H, 10 * H, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_hours, 2.0);
    }

    #[tokio::test]
    async fn clipped_on_both_sides() {
        let rows = build_report(&back_to_back(), 8 * H + 30 * M, 9 * H + 30 * M, 0)
            .await
            .unwrap();
        assert_eq!(rows[0].total_hours, 1.0);
    }

    #[tokio::test]
    async fn window_outside_all_events() {
        let rows = build_report(&back_to_back(), 20 * H, 21 * H, 0).await.unwrap();
        assert_eq!(rows[0].total_hours, 0.0);
    }

    #[tokio::test]
    async fn rounding_happens_once_at_the_end() {
        // Three 20-minute events: per-term rounding would give 0.33 * 3 = 0.99.
        let store = Snapshot::new(vec![(
            room(1),
            vec![
                event(1, 0, 20 * M),
                event(2, H, H + 20 * M),
                event(3, 2 * H, 2 * H + 20 * M),
            ],
        )]);
        let rows = build_report(&store, 0, 3 * H, 0).await.unwrap();
        assert_eq!(rows[0].total_hours, 1.0);
    }

    #[tokio::test]
    async fn upcoming_uses_now_not_range() {
        let store = Snapshot::new(vec![(
            room(1),
            vec![event(1, H, 2 * H), event(2, 5 * H, 6 * H), event(3, 3 * H, 4 * H)],
        )]);
        // Window covers only the first hour; upcoming still lists later events.
        let rows = build_report(&store, 0, H + 1, 3 * H).await.unwrap();
        let ids: Vec<EventId> = rows[0].upcoming.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn upcoming_includes_event_starting_exactly_now() {
        let store = Snapshot::new(vec![(room(1), vec![event(1, H, 2 * H)])]);
        let rows = build_report(&store, 0, 3 * H, H).await.unwrap();
        assert_eq!(rows[0].upcoming.len(), 1);
        let rows = build_report(&store, 0, 3 * H, H + 1).await.unwrap();
        assert!(rows[0].upcoming.is_empty());
    }

    #[tokio::test]
    async fn rows_follow_store_order() {
        let store = Snapshot::new(vec![(room(9), vec![]), (room(2), vec![]), (room(5), vec![])]);
        let rows = build_report(&store, 0, H, 0).await.unwrap();
        let ids: Vec<ResourceId> = rows.iter().map(|r| r.resource.id).collect();
        assert_eq!(ids, vec![9, 2, 5]);
        assert!(rows.iter().all(|r| r.total_hours == 0.0 && r.upcoming.is_empty()));
    }

    #[tokio::test]
    async fn invalid_range_rejected() {
        let result = build_report(&back_to_back(), 10 * H, 8 * H, 0).await;
        assert!(matches!(result, Err(EngineError::InvalidTimeRange { .. })));
        let result = build_report(&back_to_back(), 8 * H, 8 * H, 0).await;
        assert!(matches!(result, Err(EngineError::InvalidTimeRange { .. })));
    }

    #[test]
    fn round_hours_two_places() {
        assert_eq!(round_hours(1.0 / 3.0), 0.33);
        assert_eq!(round_hours(2.0 / 3.0), 0.67);
        assert_eq!(round_hours(1.005_000_1), 1.01);
        assert_eq!(round_hours(0.0), 0.0);
    }

    #[tokio::test]
    async fn report_is_idempotent() {
        let store = back_to_back();
        let first = build_report(&store, 0, 24 * H, 8 * H).await.unwrap();
        let second = build_report(&store, 0, 24 * H, 8 * H).await.unwrap();
        assert_eq!(first, second);
    }
}
