// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `/debug/mrpc` registry inspection page (§6): a hand-rendered HTML table,
//! written with `std::fmt::Write` rather than pulling in a templating crate.

use std::fmt::Write as _;

use crate::registry::ServiceRegistry;

pub const DEBUG_PATH: &str = "/debug/mrpc";

/// Renders the current state of `registry` as a standalone HTML page.
pub fn render(registry: &ServiceRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "<html><body>");
    let _ = writeln!(out, "<h1>mrpc services</h1>");

    let mut services = registry.services();
    services.sort_by(|a, b| a.name.cmp(&b.name));

    for service in services {
        let _ = writeln!(out, "<h2>{}</h2>", service.name);
        let _ = writeln!(out, "<table border=1>");
        let _ = writeln!(out, "<tr><th>Method</th><th>Calls</th></tr>");

        let mut methods = service.methods();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        for method in methods {
            let _ = writeln!(
                out,
                "<tr><td>{}</td><td align=right>{}</td></tr>",
                method.name,
                method.num_calls()
            );
        }
        let _ = writeln!(out, "</table>");
    }

    let _ = writeln!(out, "</body></html>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceBuilder;

    #[test]
    fn renders_registered_services_and_methods() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                ServiceBuilder::new("Foo")
                    .method("Sum", |_args: i64, _reply: &mut i64| async { Ok(()) })
                    .build(),
            )
            .unwrap();

        let page = render(&registry);
        assert!(page.contains("Foo"));
        assert!(page.contains("Sum"));
    }
}
