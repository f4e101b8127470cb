//! Plugin precedence ordering.
//!
//! Plugins may ask to run before or after others. The order is a
//! topological sort of those constraints that otherwise keeps load order;
//! names that are not loaded are ignored and a cycle is broken by taking
//! the earliest-loaded remaining plugin.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Precedence {
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl Precedence {
    pub fn before(names: &[&str]) -> Self {
        Self { before: names.iter().map(|n| n.to_string()).collect(), after: Vec::new() }
    }

    pub fn after(names: &[&str]) -> Self {
        Self { before: Vec::new(), after: names.iter().map(|n| n.to_string()).collect() }
    }
}

/// Indices of `plugins` (given in load order) in dispatch order.
pub fn order(plugins: &[(&str, &Precedence)]) -> Vec<usize> {
    let n = plugins.len();
    let position = |name: &str| plugins.iter().position(|(p, _)| p.eq_ignore_ascii_case(name));
    let mut edges = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    let mut add = |from: usize, to: usize, edges: &mut Vec<Vec<usize>>| {
        if from != to && !edges[from].contains(&to) {
            edges[from].push(to);
            indegree[to] += 1;
        }
    };
    for (i, (_, prec)) in plugins.iter().enumerate() {
        for name in &prec.before {
            if let Some(j) = position(name) {
                add(i, j, &mut edges);
            }
        }
        for name in &prec.after {
            if let Some(j) = position(name) {
                add(j, i, &mut edges);
            }
        }
    }

    let mut done = vec![false; n];
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let next = (0..n)
            .find(|&i| !done[i] && indegree[i] == 0)
            .or_else(|| {
                let stuck = (0..n).find(|&i| !done[i]);
                if let Some(i) = stuck {
                    tracing::warn!(plugin = plugins[i].0, "Plugin precedence cycle; breaking at load order");
                }
                stuck
            });
        let Some(i) = next else { break };
        done[i] = true;
        out.push(i);
        for &j in &edges[i] {
            indegree[j] = indegree[j].saturating_sub(1);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names<'a>(plugins: &[(&'a str, &Precedence)]) -> Vec<&'a str> {
        order(plugins).into_iter().map(|i| plugins[i].0).collect()
    }

    #[test]
    fn load_order_without_constraints() {
        let none = Precedence::default();
        assert_eq!(names(&[("A", &none), ("B", &none), ("C", &none)]), vec!["A", "B", "C"]);
    }

    #[test]
    fn before_and_after_are_honored() {
        let none = Precedence::default();
        let first = Precedence::before(&["a"]);
        let last = Precedence::after(&["C", "missing"]);
        let out = names(&[("A", &none), ("B", &last), ("C", &none), ("D", &first)]);
        let at = |n: &str| out.iter().position(|p| *p == n).unwrap();
        assert_eq!(out.len(), 4);
        assert!(at("D") < at("A"));
        assert!(at("C") < at("B"));
    }

    #[test]
    fn cycles_are_broken() {
        let a = Precedence::before(&["B"]);
        let b = Precedence::before(&["A"]);
        let out = names(&[("A", &a), ("B", &b)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], "A");
    }
}
