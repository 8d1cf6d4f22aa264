use std::{
    collections::{BTreeMap, HashMap},
    io::Cursor,
};

use rand::Rng;

use crate::{
    config::{Config, LayerOverrides},
    fs::{FileSink, MockSink},
    lookup::Summary,
};

use super::{compact, generate, Stats};

fn arg<T: std::str::FromStr>(args: &HashMap<String, Vec<String>>, name: &str) -> Option<T> {
    args.get(name)
        .and_then(|v| v.first())
        .map(|v| match v.parse() {
            Ok(v) => v,
            Err(_) => panic!("bad value for {}: {:?}", name, v),
        })
}

fn config_from_args(mut config: Config, args: &HashMap<String, Vec<String>>) -> Config {
    LayerOverrides {
        alpha: arg(args, "ha"),
        k: arg(args, "hk"),
        compaction_factor: arg(args, "hcf"),
        max_depth: arg(args, "hdepth"),
    }
    .apply(&mut config.host);
    LayerOverrides {
        alpha: arg(args, "pa"),
        k: arg(args, "pk"),
        compaction_factor: arg(args, "pcf"),
        max_depth: arg(args, "pdepth"),
    }
    .apply(&mut config.path);
    config
}

fn render(output: &[u8], stats: &Stats) -> String {
    format!(
        "{}lines: {} -> {}, rollups: {}, skipped: {}\n",
        String::from_utf8_lossy(output),
        stats.input_lines,
        stats.output_lines,
        stats.rollups,
        stats.skipped
    )
}

#[test]
fn test_compact_datadriven() {
    datadriven::walk("src/compact/testdata/", |f| {
        let mut sink = MockSink::new();
        let mut last = Vec::new();
        f.run(|test_case| match test_case.directive.as_str() {
            "compact" | "recompact" | "generate" => {
                let input = match test_case.directive.as_str() {
                    "recompact" => last.clone(),
                    _ => test_case
                        .input
                        .lines()
                        .flat_map(|l| format!("{}\n", l).into_bytes())
                        .collect(),
                };
                sink = MockSink::new();
                let stats = match test_case.directive.as_str() {
                    "generate" => {
                        let config = config_from_args(Config::uncompacted(), &test_case.args);
                        generate(&input[..], sink.clone(), &config).unwrap()
                    }
                    _ => {
                        let config = config_from_args(Config::default(), &test_case.args);
                        compact(&input[..], sink.clone(), &config).unwrap()
                    }
                };
                last = sink.contents();
                assert_eq!(stats.output_bytes, last.len() as u64);
                render(&last, &stats)
            }
            "trace" => {
                let mut result = String::new();
                for event in (*sink.data).borrow_mut().take_events() {
                    event.write_abbrev(&mut result).unwrap();
                    result.push('\n');
                }
                result
            }
            _ => {
                panic!("unhandled");
            }
        })
    })
}

#[test]
fn test_io_failure() {
    let input = "com,example)/a 1\ncom,example)/b 1\ncom,example)/c 1\n";
    let mut config = Config::default();
    config.path.alpha = 1.0;
    config.path.k = 0.0;

    // Let the writes through and fail on the rollup's seek.
    let sink = MockSink::new();
    (*sink.data).borrow_mut().schedule_crash(3);
    assert!(compact(input.as_bytes(), sink, &config).is_err());

    // Failing on the final sync is fatal too.
    let sink = MockSink::new();
    (*sink.data).borrow_mut().schedule_crash(2);
    let err = compact("com,example)/a 1\n".as_bytes(), sink, &config).unwrap_err();
    assert_eq!(err.to_string(), "sink is down");
}

#[test]
fn test_stats() -> anyhow::Result<()> {
    let input = "\
!meta {\"name\": \"test\"}
com,example)/a 3
com,example)/b 4
com,example)/c 5
";
    let mut config = Config::default();
    config.path.alpha = 2.0;
    config.path.k = 0.0;
    let sink = MockSink::new();
    let stats = compact(input.as_bytes(), sink.clone(), &config)?;
    let out = "!meta {\"name\": \"test\"}\ncom,example)/* 12\n";
    assert_eq!(sink.contents(), out.as_bytes());
    assert_eq!(
        stats,
        Stats {
            input_lines: 4,
            output_lines: 2,
            input_bytes: input.len() as u64,
            output_bytes: out.len() as u64,
            rollups: 1,
            skipped: 0,
        }
    );
    assert_eq!(stats.to_string(), format!("4 2 {} {} 1", input.len(), out.len()));
    Ok(())
}

#[test]
fn test_default_cutoff() -> anyhow::Result<()> {
    // The default path cutoff at depth 1 is a little over 9 children.
    let mut input = String::new();
    for i in 0..10 {
        input.push_str(&format!("com,example)/a/{} 1\n", i));
    }
    input.push_str("com,example)/b 1\n");

    let sink = MockSink::new();
    let stats = compact(input.as_bytes(), sink.clone(), &Config::default())?;
    assert_eq!(sink.contents(), b"com,example)/a/* 10\ncom,example)/b 1\n");
    assert_eq!(stats.rollups, 1);

    let sink = MockSink::new();
    let stats = compact(&input.as_bytes()[19..], sink.clone(), &Config::default())?;
    assert_eq!(stats.rollups, 0);
    assert_eq!(stats.output_lines, 10);
    Ok(())
}

#[test]
fn test_file_sink_compaction() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("summary.txt");
    let input = "com,example)/a 1\ncom,example)/b 1\ncom,example)/c 1\ncom,other)/ 2\n";
    let mut config = Config::default();
    config.path.alpha = 2.0;
    config.path.k = 0.0;

    let stats = compact(input.as_bytes(), FileSink::create(&path)?, &config)?;
    let out = std::fs::read(&path)?;
    assert_eq!(out, b"com,example)/* 3\ncom,other)/ 2\n");
    assert_eq!(stats.output_bytes, out.len() as u64);
    Ok(())
}

#[test]
fn test_keys_written_as_read() -> anyhow::Result<()> {
    let mut input = String::from(
        "com,example)/a-b 1\ncom,example)/a/ 1\ncom,example)/c.html 1\ncom,example)/c?x=1 1\n",
    );
    for i in 0..40 {
        input.push_str(&format!("com,example)/d{:02} 1\n", i));
    }
    let sink = MockSink::new();
    compact(input.as_bytes(), sink.clone(), &Config::uncompacted())?;
    let out = sink.contents();
    assert_eq!(out, input.as_bytes());

    let mut summary = Summary::new(Cursor::new(out))?;
    for line in input.lines() {
        let key = line.split(' ').next().unwrap();
        let hit = summary.lookup(key.as_bytes())?.unwrap();
        assert_eq!(hit.key, key.as_bytes());
        assert_eq!(hit.distance, 0);
    }
    Ok(())
}

#[test]
fn test_meta_verbatim() -> anyhow::Result<()> {
    let input = "!context x\r\ncom,example)/a 1\r\n!note y";
    let sink = MockSink::new();
    let stats = compact(input.as_bytes(), sink.clone(), &Config::default())?;
    assert_eq!(sink.contents(), b"!context x\r\ncom,example)/a 1\n!note y\n");
    assert_eq!(stats.output_lines, 3);

    let sink = MockSink::new();
    generate(input.as_bytes(), sink.clone(), &Config::uncompacted())?;
    assert_eq!(sink.contents(), b"!context x\r\ncom,example)/a 1\n!note y\n");
    Ok(())
}

fn random_summary<R: Rng>(rng: &mut R) -> BTreeMap<String, u64> {
    let mut records = BTreeMap::new();
    for _ in 0..rng.gen_range(1..200) {
        let mut key = ["com", "org"][rng.gen_range(0..2)].to_owned();
        for _ in 1..rng.gen_range(2..5) {
            key.push(',');
            key.push(['a', 'b', 'c'][rng.gen_range(0..3)]);
        }
        key.push(')');
        // Segments that sort around '/' once a query or slash is trimmed.
        for _ in 0..rng.gen_range(0..4) {
            key.push('/');
            key.push_str(["x", "y", "x-1", "x.html", "y-", "z.1"][rng.gen_range(0..6)]);
            if rng.gen_bool(0.3) {
                key.push_str(&rng.gen_range(0..2).to_string());
            }
        }
        match rng.gen_range(0..5) {
            0 => key.push('/'),
            1 => key.push_str(&format!("?q={}", rng.gen_range(0..3))),
            _ => {}
        }
        records.insert(key, rng.gen_range(1..5));
    }
    records
}

fn parse_output(out: &[u8]) -> Vec<(String, u64)> {
    String::from_utf8_lossy(out)
        .lines()
        .map(|line| {
            let (key, freq) = line.split_once(' ').unwrap();
            (key.to_owned(), freq.parse().unwrap())
        })
        .collect()
}

#[test]
fn test_compaction_properties() -> anyhow::Result<()> {
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let records = random_summary(&mut rng);
        let input: String = records
            .iter()
            .map(|(k, f)| format!("{} {}\n", k, f))
            .collect();
        let total: u64 = records.values().sum();

        let mut prev_lines = 0;
        for cf in [0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 4.0] {
            let mut config = Config::default();
            config.host.alpha = 3.0;
            config.host.k = 0.5;
            config.host.compaction_factor = cf;
            config.path.alpha = 3.0;
            config.path.k = 0.7;
            config.path.compaction_factor = cf;

            let sink = MockSink::new();
            let stats = compact(input.as_bytes(), sink.clone(), &config)?;
            let out = sink.contents();
            let lines = parse_output(&out);

            assert_eq!(lines.len() as u64, stats.output_lines);
            assert!(lines.windows(2).all(|w| w[0].0 < w[1].0), "{:?}", lines);
            assert_eq!(lines.iter().map(|(_, f)| f).sum::<u64>(), total);
            assert!(stats.output_lines >= prev_lines, "cf {} shrank output", cf);
            prev_lines = stats.output_lines;

            // Every input key is still answered, and exact survivors exactly.
            let mut summary = Summary::new(Cursor::new(out.clone()))?;
            for (key, freq) in records.iter() {
                let hit = match summary.lookup(key.as_bytes())? {
                    Some(hit) => hit,
                    None => panic!("{} not covered by {:?}", key, lines),
                };
                if hit.key == key.as_bytes() {
                    assert_eq!(hit.frequency, *freq);
                }
                if lines.iter().any(|(k, _)| k == key) {
                    assert_eq!(hit.key, key.as_bytes());
                    assert_eq!(hit.distance, 0);
                }
            }

            let again = MockSink::new();
            let restats = compact(&out[..], again.clone(), &config)?;
            assert_eq!(again.contents(), out);
            assert_eq!(restats.output_lines, stats.output_lines);
        }
    }
    Ok(())
}
