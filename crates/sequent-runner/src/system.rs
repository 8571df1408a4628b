//! Declarative pipeline composition.

/// A follow graph built from pipeline expressions.
///
/// `pipe(["a", "b", "c"])` declares that `b` follows `a` and `c` follows
/// `b`. A name may appear in several pipelines; there is one process
/// instance per distinct name. Cycles and self-follow (`["a", "a"]`) are
/// permitted: every hop is a read/write across a durable log, not an
/// object reference.
#[derive(Debug, Clone, Default)]
pub struct System {
    names: Vec<String>,
    edges: Vec<(String, String)>,
}

impl System {
    /// An empty system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one pipeline expression.
    pub fn pipe<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut previous: Option<String> = None;
        for name in chain {
            let name = name.into();
            if !self.names.contains(&name) {
                self.names.push(name.clone());
            }
            if let Some(upstream) = previous {
                let edge = (upstream, name.clone());
                if !self.edges.contains(&edge) {
                    self.edges.push(edge);
                }
            }
            previous = Some(name);
        }
        self
    }

    /// Distinct process names, in first-mention order.
    pub fn processes(&self) -> &[String] {
        &self.names
    }

    /// Follow edges as `(upstream, downstream)` pairs.
    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    /// Names the given process follows.
    pub fn upstreams_of(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, downstream)| downstream == name)
            .map(|(upstream, _)| upstream.as_str())
            .collect()
    }

    /// Names following the given process.
    pub fn downstreams_of(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(upstream, _)| upstream == name)
            .map(|(_, downstream)| downstream.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipes_build_edges_and_dedupe() {
        let system = System::new()
            .pipe(["orders", "reservations", "payments"])
            .pipe(["payments", "orders"])
            .pipe(["orders", "reservations"]);

        assert_eq!(system.processes(), ["orders", "reservations", "payments"]);
        assert_eq!(
            system.edges(),
            [
                ("orders".to_owned(), "reservations".to_owned()),
                ("reservations".to_owned(), "payments".to_owned()),
                ("payments".to_owned(), "orders".to_owned()),
            ]
        );
        assert_eq!(system.upstreams_of("orders"), ["payments"]);
        assert_eq!(system.downstreams_of("orders"), ["reservations"]);
    }

    #[test]
    fn self_follow_is_permitted() {
        let system = System::new().pipe(["commands", "commands"]);
        assert_eq!(system.processes(), ["commands"]);
        assert_eq!(system.upstreams_of("commands"), ["commands"]);
    }
}
