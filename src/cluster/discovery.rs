//! Server kind discovery.
//!
//! `list_server_kinds` enumerates the preferred kinds the server offers so
//! the supervisor can compute its subscriber set; `resolve_kind` maps a
//! (group, version, kind) triple parsed from a filename back to a served
//! kind identity for user-driven creates.

use anyhow::{Context, Result};
use kube::Client;
use kube::discovery::{Discovery, Scope, verbs};

use super::KindRef;

/// Enumerate the currently preferred kinds server-wide.
///
/// Only kinds that can be listed and watched are reported; subresources
/// (plural containing `/`) are excluded.
pub async fn list_server_kinds(client: &Client) -> Result<Vec<KindRef>> {
    let discovery = Discovery::new(client.clone())
        .run()
        .await
        .context("server resource discovery failed")?;

    let mut kinds = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::WATCH) {
                continue;
            }
            if ar.plural.contains('/') {
                continue;
            }
            kinds.push(KindRef {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: caps.scope == Scope::Namespaced,
            });
        }
    }
    Ok(kinds)
}

/// Resolve a normalized (group, version, kind) triple to a served kind.
///
/// The kind token comes from a filename and is lowercased; matching against
/// the served kind name is case-insensitive. The literal group `core` maps to
/// the unnamed group. `Ok(None)` means discovery answered but does not serve
/// such a kind; `Err` means discovery itself failed.
pub async fn resolve_kind(
    client: &Client,
    group: &str,
    version: &str,
    kind: &str,
) -> Result<Option<KindRef>> {
    let mut group = group.trim().to_lowercase();
    let version = version.trim().to_lowercase();
    let kind = kind.trim().to_lowercase();
    if group == "core" {
        group = String::new();
    }

    let apigroup = match kube::discovery::group(client, &group).await {
        Ok(apigroup) => apigroup,
        // An unknown group is an unknown kind, not a discovery outage.
        Err(err) if matches!(&err, kube::Error::Api(resp) if resp.code == 404) => {
            return Ok(None);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("discovery failed for group {group:?}"));
        }
    };

    for (ar, caps) in apigroup.versioned_resources(&version) {
        if ar.plural.contains('/') {
            continue;
        }
        if ar.kind.to_lowercase() == kind {
            return Ok(Some(KindRef {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: caps.scope == Scope::Namespaced,
            }));
        }
    }

    Ok(None)
}
