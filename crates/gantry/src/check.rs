use std::process::ExitCode;

use gantry_api::{report::Report, ResourceKind};
use gantry_core::{snapshot::Config, InputSnapshot, Registry, Settings, Storage, Translator};

/// Translate everything in storage once and print a report per object.
///
/// Endpoint discovery doesn't run, so clusters for discovered upstreams have
/// no endpoints. That doesn't change whether anything is accepted.
pub(crate) async fn run(settings: &Settings) -> gantry_core::Result<ExitCode> {
    let storage = Storage::from_settings(&settings.storage).await?;
    let snapshot = read_snapshot(&storage).await?;
    let registry = Registry::with_defaults(settings)?;
    let translator = Translator::new(registry, settings.clone());

    let checked = check(&translator, &snapshot);
    for report in &checked.reports {
        println!("{}", format_report(report));
    }
    for role in &checked.withheld_roles {
        println!("role {role}: configuration would not be pushed, it depends on rejected upstreams");
    }

    Ok(if checked.ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn read_snapshot(storage: &Storage) -> gantry_core::Result<InputSnapshot> {
    let config = Config {
        upstreams: storage.upstreams.list(None).await?,
        upstream_groups: storage.upstream_groups.list(None).await?,
        virtual_services: storage.virtual_services.list(None).await?,
    };
    let secrets = storage.secrets.list(None).await?;
    let artifacts = storage.artifacts.list(None).await?;

    Ok(InputSnapshot::new(config, secrets, artifacts, vec![]))
}

#[derive(Debug, Default)]
struct Checked {
    reports: Vec<Report>,
    withheld_roles: Vec<String>,
}

impl Checked {
    fn ok(&self) -> bool {
        self.withheld_roles.is_empty() && !self.reports.iter().any(Report::is_rejected)
    }
}

fn check(translator: &Translator, snapshot: &InputSnapshot) -> Checked {
    let mut checked = Checked {
        reports: translator.validate_upstreams(snapshot),
        ..Default::default()
    };

    for role in snapshot.roles() {
        let result = translator.translate(&role, &snapshot.for_role(&role));
        if result.invalid_config {
            checked.withheld_roles.push(role.clone());
        }
        checked.reports.extend(
            result
                .reports
                .into_iter()
                .filter(|r| r.kind == ResourceKind::VirtualService)
                .map(|r| r.for_role(&role)),
        );
    }

    checked
}

fn format_report(report: &Report) -> String {
    let mut line = format!("{:?} {} {}", report.state, report.kind, report.object_ref);
    if let Some(role) = &report.role {
        line.push_str(&format!(" (role {role})"));
    }
    if let Some(reason) = &report.reason {
        line.push_str(&format!(": {reason}"));
    }
    for warning in &report.warnings {
        line.push_str(&format!("\n  warning: {warning}"));
    }
    line
}

#[cfg(test)]
mod test {
    use super::*;
    use gantry_api::{
        http::{Matcher, Route, RouteAction, VirtualService},
        upstream::{Host, StaticUpstream, Upstream, UpstreamSpec},
        Metadata, ResourceRef,
    };
    use gantry_core::settings::StorageSettings;

    fn upstream(name: &str) -> Upstream {
        Upstream::new(
            Metadata::new("ns", name),
            UpstreamSpec::Static(StaticUpstream {
                hosts: vec![Host::new("1.2.3.4", 80)],
                ..Default::default()
            }),
        )
    }

    fn virtual_service(name: &str, path: &str) -> VirtualService {
        let mut vs = VirtualService::new(Metadata::new("ns", name));
        vs.domains = vec![format!("{name}.example.com")];
        vs.routes = vec![Route::new(
            Matcher::prefix(path),
            RouteAction::single(ResourceRef::new("ns", "u1")),
        )];
        vs
    }

    #[tokio::test]
    async fn test_check_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            storage: StorageSettings::File {
                root: dir.path().to_path_buf(),
            },
            ..Default::default()
        };

        let storage = Storage::from_settings(&settings.storage).await.unwrap();
        storage.upstreams.create(upstream("u1")).await.unwrap();
        storage
            .virtual_services
            .create(virtual_service("good", "/"))
            .await
            .unwrap();

        let translator = Translator::new(Registry::with_defaults(&settings).unwrap(), settings);
        let checked = check(&translator, &read_snapshot(&storage).await.unwrap());
        assert!(checked.ok(), "{checked:?}");
        assert_eq!(checked.reports.len(), 2);

        storage
            .virtual_services
            .create(virtual_service("bad", "/foo<bar"))
            .await
            .unwrap();
        let checked = check(&translator, &read_snapshot(&storage).await.unwrap());
        assert!(!checked.ok());

        let bad = checked
            .reports
            .iter()
            .find(|r| r.object_ref.name == "bad")
            .unwrap();
        let line = format_report(bad);
        assert!(line.starts_with("Rejected VirtualService ns.bad (role ingress): "), "{line}");
        assert!(line.contains("invalid path"), "{line}");
    }

    #[test]
    fn test_check_unreferenced_upstream() {
        let settings = Settings::default();
        let translator = Translator::new(Registry::with_defaults(&settings).unwrap(), settings);

        let mut bad = upstream("unused");
        bad.spec = UpstreamSpec::Static(StaticUpstream::default());
        let snapshot = InputSnapshot::new(
            Config {
                upstreams: vec![bad],
                ..Default::default()
            },
            vec![],
            vec![],
            vec![],
        );

        let checked = check(&translator, &snapshot);
        assert!(!checked.ok());
        assert!(checked.withheld_roles.is_empty());
        let line = format_report(&checked.reports[0]);
        assert!(line.starts_with("Rejected Upstream ns.unused: "), "{line}");
    }
}
