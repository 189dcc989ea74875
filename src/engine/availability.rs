use crate::limits::MAX_SLOTS_PER_QUERY;
use crate::model::*;

// ── Interval algebra ──────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Sort then merge.
pub fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// `base − to_remove`. Both inputs sorted by start; `base` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// Time covered by every list. Each list must be disjoint.
///
/// Sweep line over all boundaries: a moment is kept while the number of
/// lists covering it equals the number of lists.
pub fn intersect_all(lists: &[Vec<Span>]) -> Vec<Span> {
    if lists.is_empty() || lists.iter().any(|l| l.is_empty()) {
        return Vec::new();
    }
    if lists.len() == 1 {
        return lists[0].clone();
    }

    let mut events: Vec<(Ms, i32)> = Vec::new();
    for list in lists {
        for s in list {
            events.push((s.start, 1));
            events.push((s.end, -1));
        }
    }
    // Ends before starts at the same instant: touching spans do not intersect.
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let threshold = lists.len() as i32;
    let mut result = Vec::new();
    let mut count = 0i32;
    let mut seg_start: Option<Ms> = None;

    for (time, delta) in events {
        let prev = count;
        count += delta;
        if prev < threshold && count >= threshold {
            seg_start = Some(time);
        } else if prev >= threshold
            && count < threshold
            && let Some(start) = seg_start.take()
            && time > start
        {
            result.push(Span::new(start, time));
        }
    }

    result
}

/// Grow every span by `before`/`after` and re-merge.
pub fn dilate(spans: &[Span], before: Ms, after: Ms) -> Vec<Span> {
    normalize(spans.iter().map(|s| s.expand(before, after)).collect())
}

// ── Slot computation ──────────────────────────────────────────────

/// One required host's inputs for a window: working hours and busy time.
#[derive(Debug, Clone, Default)]
pub struct HostCalendar {
    /// Working intervals, disjoint and sorted.
    pub working: Vec<Span>,
    /// External calendar busy spans, as synced.
    pub calendar_busy: Vec<Span>,
    /// Existing live bookings, already buffer-expanded.
    pub booked: Vec<Span>,
}

impl HostCalendar {
    /// Where an interval carrying `buffers` may start and end on this host.
    ///
    /// An interval is free when its raw span lies within working hours and
    /// its buffer-expanded span touches neither calendar busy time nor another
    /// booking's buffer-expanded span. Shifting the busy spans the opposite way
    /// (post buffer to the left, pre buffer to the right) turns that into a
    /// plain containment test on the raw span.
    pub fn free(&self, buffers: Buffers) -> Vec<Span> {
        let mut blocked = self.calendar_busy.clone();
        blocked.extend_from_slice(&self.booked);
        let blocked = dilate(&blocked, buffers.post_ms(), buffers.pre_ms());
        subtract_intervals(&self.working, &blocked)
    }
}

/// Free time shared by all required hosts, clipped to `window`.
pub fn shared_free_time(calendars: &[HostCalendar], buffers: Buffers, window: &Span) -> Vec<Span> {
    let per_host: Vec<Vec<Span>> = calendars
        .iter()
        .map(|c| {
            c.free(buffers)
                .iter()
                .filter_map(|s| s.intersect(window))
                .collect()
        })
        .collect();
    intersect_all(&per_host)
}

/// Smallest multiple of `step` that is `>= t`.
fn ceil_to_grid(t: Ms, step: Ms) -> Ms {
    let rem = t.rem_euclid(step);
    if rem == 0 { t } else { t + (step - rem) }
}

/// Candidate slots of length `duration` on the `step` grid, each fully inside
/// one free interval. Ascending by start; no duplicates.
pub fn slice_slots(free: &[Span], duration: Ms, step: Ms) -> Vec<Span> {
    let mut slots = Vec::new();
    if duration <= 0 || step <= 0 {
        return slots;
    }
    for f in free {
        let mut t = ceil_to_grid(f.start, step);
        while t + duration <= f.end {
            slots.push(Span::new(t, t + duration));
            if slots.len() >= MAX_SLOTS_PER_QUERY {
                return slots;
            }
            t += step;
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR;
    const M: Ms = MINUTE;

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let result = subtract_intervals(&base, &[Span::new(200, 300)]);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 250)]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let result = subtract_intervals(&[Span::new(100, 300)], &[Span::new(150, 200)]);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_one_removal_spanning_two_bases() {
        let base = vec![Span::new(0, 100), Span::new(200, 300)];
        let result = subtract_intervals(&base, &[Span::new(50, 250)]);
        assert_eq!(result, vec![Span::new(0, 50), Span::new(250, 300)]);
    }

    // ── merge / intersect ────────────────────────────────

    #[test]
    fn merge_overlapping_and_adjacent() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(400, 450), Span::new(500, 600)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 450), Span::new(500, 600)]);
    }

    #[test]
    fn intersect_two_lists() {
        let a = vec![Span::new(9 * H, 12 * H)];
        let b = vec![Span::new(11 * H, 14 * H)];
        assert_eq!(intersect_all(&[a, b]), vec![Span::new(11 * H, 12 * H)]);
    }

    #[test]
    fn intersect_touching_is_empty() {
        let a = vec![Span::new(0, 100)];
        let b = vec![Span::new(100, 200)];
        assert!(intersect_all(&[a, b]).is_empty());
    }

    #[test]
    fn intersect_with_empty_list_is_empty() {
        let a = vec![Span::new(0, 100)];
        assert!(intersect_all(&[a, vec![]]).is_empty());
    }

    #[test]
    fn intersect_three_lists_fragments() {
        let a = vec![Span::new(0, 1000)];
        let b = vec![Span::new(100, 300), Span::new(500, 900)];
        let c = vec![Span::new(200, 600)];
        assert_eq!(
            intersect_all(&[a, b, c]),
            vec![Span::new(200, 300), Span::new(500, 600)]
        );
    }

    #[test]
    fn dilate_merges_neighbours() {
        let spans = vec![Span::new(100, 200), Span::new(230, 300)];
        assert_eq!(dilate(&spans, 10, 20), vec![Span::new(90, 320)]);
    }

    // ── slicing ──────────────────────────────────────────

    #[test]
    fn slices_on_grid() {
        let free = vec![Span::new(9 * H + 7 * M, 10 * H)];
        let slots = slice_slots(&free, 30 * M, 15 * M);
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![9 * H + 15 * M, 9 * H + 30 * M]);
    }

    #[test]
    fn short_free_interval_yields_nothing() {
        let free = vec![Span::new(9 * H, 9 * H + 20 * M)];
        assert!(slice_slots(&free, 30 * M, 15 * M).is_empty());
    }

    #[test]
    fn back_to_back_slots_with_equal_step() {
        let free = vec![Span::new(9 * H, 10 * H)];
        let slots = slice_slots(&free, 30 * M, 30 * M);
        assert_eq!(slots, vec![Span::new(9 * H, 9 * H + 30 * M), Span::new(9 * H + 30 * M, 10 * H)]);
        assert!(!slots[0].overlaps(&slots[1]));
    }

    // ── free time ────────────────────────────────────────

    #[test]
    fn buffers_keep_expanded_spans_apart() {
        let cal = HostCalendar {
            working: vec![Span::new(9 * H, 12 * H)],
            calendar_busy: vec![],
            booked: vec![Span::new(9 * H + 45 * M, 10 * H + 45 * M)],
        };
        let buffers = Buffers { pre_minutes: 15, post_minutes: 15 };
        let free = cal.free(buffers);
        assert_eq!(free, vec![Span::new(9 * H, 9 * H + 30 * M), Span::new(11 * H, 12 * H)]);

        let slots = slice_slots(&free, 30 * M, 15 * M);
        let existing = Span::new(9 * H + 45 * M, 10 * H + 45 * M);
        assert!(!slots.is_empty());
        for s in slots {
            assert!(!s.expand(15 * M, 15 * M).overlaps(&existing));
        }
    }

    #[test]
    fn calendar_busy_blocks_raw_time() {
        let cal = HostCalendar {
            working: vec![Span::new(9 * H, 17 * H)],
            calendar_busy: vec![Span::new(12 * H, 13 * H)],
            booked: vec![],
        };
        assert_eq!(
            cal.free(Buffers::default()),
            vec![Span::new(9 * H, 12 * H), Span::new(13 * H, 17 * H)]
        );
    }

    #[test]
    fn shared_free_time_intersects_hosts() {
        let a = HostCalendar {
            working: vec![Span::new(9 * H, 12 * H)],
            ..Default::default()
        };
        let b = HostCalendar {
            working: vec![Span::new(11 * H, 14 * H)],
            ..Default::default()
        };
        let window = Span::new(0, 24 * H);
        let free = shared_free_time(&[a, b], Buffers::default(), &window);
        assert_eq!(free, vec![Span::new(11 * H, 12 * H)]);

        let slots = slice_slots(&free, 30 * M, 15 * M);
        assert_eq!(slots.len(), 3);
        assert!(slots.iter().all(|s| s.start >= 11 * H && s.end <= 12 * H));
    }

    #[test]
    fn shared_free_time_busy_on_either_host_blocks() {
        let a = HostCalendar {
            working: vec![Span::new(9 * H, 17 * H)],
            booked: vec![Span::new(10 * H, 11 * H)],
            ..Default::default()
        };
        let b = HostCalendar {
            working: vec![Span::new(9 * H, 17 * H)],
            calendar_busy: vec![Span::new(14 * H, 15 * H)],
            ..Default::default()
        };
        let window = Span::new(9 * H, 17 * H);
        let free = shared_free_time(&[a, b], Buffers::default(), &window);
        assert_eq!(
            free,
            vec![Span::new(9 * H, 10 * H), Span::new(11 * H, 14 * H), Span::new(15 * H, 17 * H)]
        );
    }

    #[test]
    fn window_clips_free_time() {
        let a = HostCalendar {
            working: vec![Span::new(9 * H, 17 * H)],
            ..Default::default()
        };
        let window = Span::new(10 * H, 11 * H);
        assert_eq!(
            shared_free_time(&[a], Buffers::default(), &window),
            vec![Span::new(10 * H, 11 * H)]
        );
    }
}
