use pgfront::{QueryResult, ResultChain, ResultStatus};

pub fn chain(chain: &ResultChain) {
    for (i, result) in chain.iter().enumerate() {
        print!("[{i}] {:?}", result.status());
        if let Some(command) = result.command() {
            print!(" {command}");
        }
        println!();

        for notice in result.notices() {
            println!("    {}", notice.trim_end());
        }
        if let Some(message) = result.message() {
            println!("    {message}");
        }
        if result.status() == ResultStatus::TuplesOk {
            rows(result);
        }
    }
}

fn rows(result: &QueryResult) {
    let header: Vec<_> = result.columns().iter().map(|e| e.name.as_str()).collect();
    println!("    {}", header.join(" | "));

    for row in result.rows() {
        let values: Vec<_> = row.values().map(|e| match e {
            Some(value) => String::from_utf8_lossy(value).into_owned(),
            None => "NULL".to_owned(),
        }).collect();
        println!("    {}", values.join(" | "));
    }
    println!("    ({} rows)", result.rows().len());
}
