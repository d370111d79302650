use chrono::{Datelike, Duration, NaiveDate};
use rand::Rng;
use std::env;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use chunked_aggregator::Field;

const EXP_TYPES: [&str; 7] = [
    "Entertainment",
    "Food",
    "Bills",
    "Fuel",
    "Travel",
    "Motor",
    "Housing",
];

fn main() -> std::io::Result<()> {
    let mut args = env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "data/transactions.csv".to_string());
    let rows: u64 = args.next().and_then(|n| n.parse().ok()).unwrap_or(10_000_000);
    let customers: u32 = args.next().and_then(|n| n.parse().ok()).unwrap_or(5_000);

    if let Some(parent) = Path::new(&path).parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(&path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "{}", Field::header_line())?;

    let epoch = NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default();
    let mut rng = rand::rng();
    for i in 0..rows {
        let cust = rng.random_range(0..customers);
        let start = epoch + Duration::days(rng.random_range(0..1500));
        let end = if rng.random_bool(0.2) {
            (start + Duration::days(rng.random_range(1500..4000)))
                .format("%Y-%m-%d")
                .to_string()
        } else {
            String::new()
        };
        let date = start + Duration::days(rng.random_range(0..3650));
        let exp_type = EXP_TYPES[rng.random_range(0..EXP_TYPES.len())];
        let amount = rng.random_range(1.0..500.0_f64);

        writeln!(
            writer,
            "CI{:06},{},{},T{:010},{},{},{},{},{},{:.2}",
            cust,
            start.format("%Y-%m-%d"),
            end,
            i,
            date.format("%Y-%m-%d"),
            date.year(),
            date.month(),
            date.day(),
            exp_type,
            amount
        )?;
    }
    writer.flush()?;

    println!("Transactions CSV generated: {} ({} rows)", path, rows);
    Ok(())
}
