//! Named timed events, one-shot or periodic.
//!
//! The scheduler never sleeps on its own: the driver asks for
//! [`Scheduler::next_deadline`] and calls [`Scheduler::due`] when it passes.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
struct Event {
    at: f64,
    period: Option<f64>,
    /// Plugin that scheduled it, or `None` for the session's own events.
    owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fired {
    pub name: String,
    pub owner: Option<String>,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    events: BTreeMap<String, Event>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a one-shot event, replacing any event of the same name.
    pub fn add(&mut self, name: &str, at: f64, owner: Option<&str>) {
        self.events.insert(
            name.to_string(),
            Event { at, period: None, owner: owner.map(str::to_string) },
        );
    }

    /// First firing is one period from `now`.
    pub fn add_periodic(&mut self, name: &str, period: f64, now: f64, owner: Option<&str>) {
        let period = period.max(0.001);
        self.events.insert(
            name.to_string(),
            Event { at: now + period, period: Some(period), owner: owner.map(str::to_string) },
        );
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.events.remove(name).is_some()
    }

    /// Drop every event a plugin owns, e.g. when it unloads.
    pub fn remove_owned_by(&mut self, owner: &str) -> usize {
        let before = self.events.len();
        self.events
            .retain(|_, e| !e.owner.as_deref().is_some_and(|o| o.eq_ignore_ascii_case(owner)));
        before - self.events.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_deadline(&self) -> Option<f64> {
        self.events.values().map(|e| e.at).min_by(f64::total_cmp)
    }

    /// Pop every event due at `now`, earliest first. Periodic events are
    /// rescheduled; a periodic event that fell far behind fires once.
    pub fn due(&mut self, now: f64) -> Vec<Fired> {
        let mut fired: Vec<(f64, Fired)> = Vec::new();
        let mut finished = Vec::new();
        for (name, event) in self.events.iter_mut() {
            if event.at > now {
                continue;
            }
            fired.push((event.at, Fired { name: name.clone(), owner: event.owner.clone() }));
            match event.period {
                Some(period) => {
                    while event.at <= now {
                        event.at += period;
                    }
                }
                None => finished.push(name.clone()),
            }
        }
        for name in finished {
            self.events.remove(&name);
        }
        fired.sort_by(|a, b| a.0.total_cmp(&b.0));
        fired.into_iter().map(|(_, f)| f).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fired: &[Fired]) -> Vec<&str> {
        fired.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn one_shot_events_fire_once_in_order() {
        let mut s = Scheduler::new();
        s.add("late", 20.0, None);
        s.add("early", 10.0, Some("Seen"));
        assert_eq!(s.next_deadline(), Some(10.0));
        assert!(s.due(5.0).is_empty());
        let fired = s.due(25.0);
        assert_eq!(names(&fired), vec!["early", "late"]);
        assert_eq!(fired[0].owner.as_deref(), Some("Seen"));
        assert!(s.is_empty());
    }

    #[test]
    fn periodic_events_reschedule() {
        let mut s = Scheduler::new();
        s.add_periodic("tick", 10.0, 0.0, None);
        assert_eq!(names(&s.due(10.0)), vec!["tick"]);
        assert_eq!(s.next_deadline(), Some(20.0));
        // Far behind: one firing, next deadline in the future.
        assert_eq!(s.due(55.0).len(), 1);
        assert_eq!(s.next_deadline(), Some(60.0));
    }

    #[test]
    fn replacing_and_removing() {
        let mut s = Scheduler::new();
        s.add("x", 10.0, Some("A"));
        s.add("x", 30.0, Some("A"));
        s.add("y", 40.0, Some("B"));
        assert_eq!(s.len(), 2);
        assert!(s.due(20.0).is_empty());
        assert_eq!(s.remove_owned_by("a"), 1);
        assert!(s.remove("y"));
        assert!(!s.remove("y"));
    }
}
