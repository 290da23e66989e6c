//! Upload-bundle-notification (UBN) publisher (spec §4.9, §6.3): tells
//! uploading peers when a bundle they're seeding to us finishes, changes
//! priority/size, switches between single- and multi-uploader mode, or is
//! removed, so they can stop/adjust their own bookkeeping.
//!
//! One registration per bundle, tracking every uploader currently seeding
//! it and which connections belong to which uploader. The mode (`SU` one
//! uploader, `MU` more than one) is derived from that map and only ever
//! changes at the 1<->2-user boundary (spec §8 invariant 10), never by
//! counting past two.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

use crate::engine::QueueEngine;
use crate::types::{BundleToken, ConnectionToken, Event};

/// Single- vs multi-uploader mode for a bundle (spec §4.9, §6.3 `SU1`/`MU1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UbnMode {
    Su,
    Mu,
}

impl UbnMode {
    fn wire_token(self) -> &'static str {
        match self {
            UbnMode::Su => "SU1",
            UbnMode::Mu => "MU1",
        }
    }
}

#[derive(Debug)]
struct BundleUbnState {
    mode: UbnMode,
    users: HashMap<String, HashSet<ConnectionToken>>,
    last_reported_speed: i64,
    last_reported_percent: f64,
}

impl BundleUbnState {
    fn new() -> Self {
        Self {
            mode: UbnMode::Su,
            users: HashMap::new(),
            last_reported_speed: 0,
            last_reported_percent: 0.0,
        }
    }

    #[cfg(test)]
    fn connections_for(&self, user: &str) -> Option<&HashSet<ConnectionToken>> {
        self.users.get(user)
    }
}

#[derive(Debug, Default)]
pub struct UbnPublisher {
    bundles: Mutex<HashMap<BundleToken, BundleUbnState>>,
}

impl UbnPublisher {
    /// Registers `connection` as downloading `bundle` from `user` (spec
    /// §4.9 "starting a bundle download"). A brand-new user gets `AD1`
    /// (bundle name/size/downloaded-bytes/mode, plus token linkage); a
    /// returning user gets `CH1` linking the new connection to the bundle.
    /// The 1→2-user transition always fires `UD1 MU1` to the uploader(s)
    /// already registered (spec §8 invariant 10).
    pub async fn on_download_started(&self, engine: &QueueEngine, bundle: BundleToken, connection: ConnectionToken, user: &str) {
        let mut bundles = self.bundles.lock().await;
        let state = bundles.entry(bundle).or_insert_with(BundleUbnState::new);

        if let Some(conns) = state.users.get_mut(user) {
            conns.insert(connection);
            drop(bundles);
            self.send(engine, bundle, &format!("TO{} BU{} CH1", connection.0, bundle.0), "CH1").await;
            return;
        }

        state.users.insert(user.to_string(), HashSet::from([connection]));
        let became_mu = state.users.len() == 2;
        if became_mu {
            state.mode = UbnMode::Mu;
        }
        let mode = state.mode;
        let others: Vec<String> = state.users.keys().filter(|u| u.as_str() != user).cloned().collect();
        drop(bundles);

        let (name, size, downloaded) = bundle_stats(engine, bundle).await;
        let payload = format!(
            "BU{} NA{} SI{} DL{} {} AD1",
            bundle.0,
            name,
            size,
            downloaded,
            mode.wire_token()
        );
        self.send(engine, bundle, &payload, "AD1").await;

        if became_mu {
            for other in others {
                self.send_to(engine, bundle, &other, &format!("BU{} UD1 MU1", bundle.0), "UD1").await;
            }
        }
    }

    /// Unlinks a finished or failed connection (spec §4.9 "connection
    /// finishing or failing"). If the uploader's last connection just left,
    /// the uploader is dropped entirely; if that collapses the bundle back
    /// to one remaining uploader, `UD1 SU1 DL<bytes>` is sent to them (spec
    /// §8 invariant 10, the 2→1 transition).
    pub async fn on_connection_ended(&self, engine: &QueueEngine, bundle: BundleToken, connection: ConnectionToken, user: &str) {
        let mut bundles = self.bundles.lock().await;
        let Some(state) = bundles.get_mut(&bundle) else {
            return;
        };

        if let Some(conns) = state.users.get_mut(user) {
            conns.remove(&connection);
            if conns.is_empty() {
                state.users.remove(user);
            }
        }

        let became_su = state.users.len() == 1 && state.mode == UbnMode::Mu;
        if became_su {
            state.mode = UbnMode::Su;
        }
        let remaining_user = if became_su { state.users.keys().next().cloned() } else { None };
        let empty = state.users.is_empty();
        if empty {
            bundles.remove(&bundle);
        }
        drop(bundles);

        self.send(engine, bundle, &format!("TO{} RM1", connection.0), "RM1").await;

        if let Some(remaining) = remaining_user {
            let (_, _, downloaded) = bundle_stats(engine, bundle).await;
            self.send_to(engine, bundle, &remaining, &format!("BU{} UD1 SU1 DL{}", bundle.0, downloaded), "UD1")
                .await;
        }
    }

    /// Sends `FI1` to every registered uploader and drops all state for
    /// `bundle` (spec §4.9 "bundle finished", §8 Scenario S5).
    pub async fn on_bundle_finished(&self, engine: &QueueEngine, bundle: BundleToken) {
        let mut bundles = self.bundles.lock().await;
        let Some(state) = bundles.remove(&bundle) else {
            return;
        };
        drop(bundles);

        let mut users: Vec<&String> = state.users.keys().collect();
        users.sort();
        for user in users {
            self.send_to(engine, bundle, user, &format!("BU{} FI1", bundle.0), "FI1").await;
        }
    }

    /// Sends `UD1 SI<size>` to every registered uploader (spec §4.9 "bundle
    /// size changes").
    pub async fn on_bundle_size_changed(&self, engine: &QueueEngine, bundle: BundleToken, new_size: i64) {
        let bundles = self.bundles.lock().await;
        let Some(state) = bundles.get(&bundle) else {
            return;
        };
        let users: Vec<String> = state.users.keys().cloned().collect();
        drop(bundles);

        for user in users {
            self.send_to(engine, bundle, &user, &format!("BU{} UD1 SI{}", bundle.0, new_size), "UD1").await;
        }
    }

    /// Periodic MU-mode-only progress tick (spec §4.9 "periodic tick"):
    /// sends `DS<speed>` when current speed deviates from the last reported
    /// value by more than 10%, and `PE<percent>` when downloaded-bytes
    /// deviate from the last reported value by more than 0.5% of size.
    /// Both fields ride on one `UBN` message when both cross their
    /// threshold on the same tick.
    pub async fn tick(&self, engine: &QueueEngine) {
        let mu_bundles: Vec<BundleToken> = {
            let bundles = self.bundles.lock().await;
            bundles
                .iter()
                .filter(|(_, state)| state.mode == UbnMode::Mu)
                .map(|(&b, _)| b)
                .collect()
        };

        for bundle in mu_bundles {
            let (speed, percent) = bundle_progress(engine, bundle).await;

            let mut bundles = self.bundles.lock().await;
            let Some(state) = bundles.get_mut(&bundle) else { continue };
            if state.mode != UbnMode::Mu {
                continue;
            }

            let speed_deviated = deviates(state.last_reported_speed as f64, speed as f64, 0.10);
            let percent_deviated = (percent - state.last_reported_percent).abs() > 0.5;
            if !speed_deviated && !percent_deviated {
                continue;
            }
            if speed_deviated {
                state.last_reported_speed = speed;
            }
            if percent_deviated {
                state.last_reported_percent = percent;
            }
            let users: Vec<String> = state.users.keys().cloned().collect();
            drop(bundles);

            let mut fields = format!("BU{}", bundle.0);
            if speed_deviated {
                fields.push_str(&format!(" DS{}", format_speed(speed)));
            }
            if percent_deviated {
                fields.push_str(&format!(" PE{percent:.2}"));
            }

            for user in users {
                self.send_to(engine, bundle, &user, &fields, "UBN").await;
            }
        }
    }

    async fn send(&self, engine: &QueueEngine, bundle: BundleToken, payload: &str, kind: &str) {
        let _ = engine.collaborators.udp_transport.send("", "", payload.as_bytes().to_vec()).await;
        let _ = engine.events.send(Event::UbnSent {
            bundle,
            nick: String::new(),
            kind: kind.to_string(),
        });
    }

    async fn send_to(&self, engine: &QueueEngine, bundle: BundleToken, user: &str, payload: &str, kind: &str) {
        let _ = engine.collaborators.udp_transport.send("", "", payload.as_bytes().to_vec()).await;
        let _ = engine.events.send(Event::UbnSent {
            bundle,
            nick: user.to_string(),
            kind: kind.to_string(),
        });
    }

    /// Test/introspection helper: every connection token registered for
    /// `user` on `bundle`, if the bundle is tracked at all.
    #[cfg(test)]
    async fn connections_for(&self, bundle: BundleToken, user: &str) -> Option<HashSet<ConnectionToken>> {
        self.bundles.lock().await.get(&bundle).and_then(|s| s.connections_for(user).cloned())
    }

    #[cfg(test)]
    async fn is_tracked(&self, bundle: BundleToken) -> bool {
        self.bundles.lock().await.contains_key(&bundle)
    }
}

fn deviates(last: f64, current: f64, fraction: f64) -> bool {
    if last == 0.0 {
        return current != 0.0;
    }
    ((current - last) / last).abs() > fraction
}

/// `b`/`k`/`m` bytes/sec wire suffix (spec §6.3 speed field).
fn format_speed(bytes_per_sec: i64) -> String {
    if bytes_per_sec >= 1024 * 1024 {
        format!("{}m", bytes_per_sec / (1024 * 1024))
    } else if bytes_per_sec >= 1024 {
        format!("{}k", bytes_per_sec / 1024)
    } else {
        format!("{bytes_per_sec}b")
    }
}

async fn bundle_stats(engine: &QueueEngine, bundle: BundleToken) -> (String, i64, i64) {
    let bundles = engine.bundles.read().await;
    let Some(b) = bundles.find_bundle(bundle) else {
        return (String::new(), 0, 0);
    };
    let name = b
        .path
        .local_root
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(&b.path.local_root)
        .to_string();
    let file_tokens: Vec<_> = b.files.iter().copied().collect();
    drop(bundles);

    let files = engine.files.read().await;
    let mut size = 0;
    let mut downloaded = 0;
    for token in file_tokens {
        if let Some(f) = files.find_file(token) {
            size += f.size;
            downloaded += f.downloaded_bytes();
        }
    }
    (name, size, downloaded)
}

async fn bundle_progress(engine: &QueueEngine, bundle: BundleToken) -> (i64, f64) {
    let (_, size, downloaded) = bundle_stats(engine, bundle).await;

    let bundles = engine.bundles.read().await;
    let file_tokens: Vec<_> = bundles.find_bundle(bundle).map(|b| b.files.iter().copied().collect()).unwrap_or_default();
    drop(bundles);

    let downloads = engine.downloads.read().await;
    let speed: i64 = downloads.values().filter(|d| file_tokens.contains(&d.file)).map(|d| d.current_speed).sum();
    drop(downloads);

    let percent = if size > 0 { (downloaded as f64 / size as f64) * 100.0 } else { 0.0 };
    (speed, percent)
}
