use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use jailwarden::parser::{
    classify_error, parse_event_log, parse_global_status, parse_jail_status, parse_sections,
};
use jailwarden::reconcile::classify;

const JAIL_STATUS: &str = "Status for the jail: sshd\n\
|- Filter\n\
|  |- Currently failed:\t3\n\
|  |- Total failed:\t1204\n\
|  `- File list:\t/var/log/auth.log\n\
`- Actions\n   \
|- Currently banned:\t4\n   \
|- Total banned:\t311\n   \
`- Banned IP list:\t192.0.2.1 192.0.2.7 198.51.100.23 2001:db8::7\n";

const GLOBAL_STATUS: &str =
    "Status\n|- Number of jail:\t4\n`- Jail list:\tnginx-404, postfix, recidive, sshd\n";

// Status output that mentions failure phrases but exited cleanly.
const NOISY_STATUS: &str = "Status for the jail: sshd\n\
|- Filter\n\
|  `- Journal matches:\t_SYSTEMD_UNIT=sshd.service + _COMM=sshd ERROR\n";

fn jail_conf(jails: usize) -> String {
    let mut out = String::from("[INCLUDES]\nbefore = paths-debian.conf\n\n[DEFAULT]\nbantime = 10m\nfindtime = 10m\nmaxretry = 5\n\n");
    for i in 0..jails {
        out.push_str(&format!(
            "# jail {i}\n[jail-{i}]\nenabled = {}\nport = http,https\nlogpath = /var/log/app-{i}.log\n          /var/log/app-{i}.1.log\nmaxretry = {}\n\n",
            i % 2 == 0,
            3 + i % 4
        ));
    }
    out
}

fn event_log(lines: usize) -> String {
    (0..lines)
        .map(|i| {
            let verb = if i % 3 == 0 { "Unban" } else { "Ban" };
            format!(
                "2024-05-02 13:{:02}:{:02},512 fail2ban.actions        [811]: NOTICE  [sshd] {verb} 192.0.2.{}\n",
                (i / 60) % 60,
                i % 60,
                i % 250
            )
        })
        .collect()
}

fn status_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("status");
    group.throughput(Throughput::Bytes(JAIL_STATUS.len() as u64));

    group.bench_function("jail_status", |b| {
        b.iter(|| parse_jail_status(black_box(JAIL_STATUS)).unwrap())
    });
    group.bench_function("global_status", |b| {
        b.iter(|| parse_global_status(black_box(GLOBAL_STATUS)).unwrap())
    });
    group.bench_function("classify_clean_exit", |b| {
        b.iter(|| classify_error(black_box(NOISY_STATUS), "", Some(0)))
    });
    group.bench_function("classify_service_down", |b| {
        b.iter(|| {
            classify_error(
                "",
                black_box("ERROR  Failed to access socket path: /var/run/fail2ban/fail2ban.sock. Is fail2ban running?"),
                Some(255),
            )
        })
    });

    group.finish();
}

fn config_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    let conf = jail_conf(200);
    group.throughput(Throughput::Bytes(conf.len() as u64));

    group.bench_function("parse_sections_200_jails", |b| {
        b.iter(|| parse_sections(black_box(&conf)).unwrap())
    });
    group.bench_function("classify_jail", |b| {
        b.iter(|| classify(black_box("nginx-botsearch"), black_box("nginx-botsearch")))
    });

    group.finish();
}

fn event_log_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_log");
    let log = event_log(5_000);
    group.throughput(Throughput::Bytes(log.len() as u64));

    group.bench_function("parse_5000_lines", |b| {
        b.iter(|| parse_event_log(black_box(&log)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, status_benchmark, config_benchmark, event_log_benchmark);
criterion_main!(benches);
