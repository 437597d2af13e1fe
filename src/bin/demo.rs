//! Three threads sharing one OS thread: one sleeps and exits, one yields
//! forever, one never yields and has to be preempted.

use std::io::Write;
use std::time::{Duration, Instant};

use altstack_threads::{
    create, critical, exit_thread, join, shutdown, sleep, thread_id, yield_thread,
    SchedulerConfig,
};

fn say(text: std::fmt::Arguments<'_>) {
    critical(|| {
        let mut out = std::io::stdout().lock();
        let _ = out.write_fmt(text);
        let _ = out.flush();
    });
}

fn started(arg: usize) {
    say(format_args!(
        "\nThread {} started with arg {}\n",
        thread_id().unwrap_or(0),
        arg
    ));
}

fn sleeper(arg: usize) {
    started(arg);
    for _ in 0..5 {
        say(format_args!("{}", thread_id().unwrap_or(0)));
        sleep(Duration::from_millis(800));
    }
    exit_thread()
}

fn yielder(arg: usize) {
    started(arg);
    loop {
        say(format_args!("{}", thread_id().unwrap_or(0)));
        // Slow the output down a little without giving up the CPU.
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(20) {
            std::hint::spin_loop();
        }
        yield_thread();
    }
}

fn hog(arg: usize) {
    started(arg);
    loop {
        say(format_args!("{}", thread_id().unwrap_or(0)));
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(150) {
            std::hint::spin_loop();
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = SchedulerConfig::builder()
        .preemption_interval(Duration::from_millis(100))
        .build()?;
    altstack_threads::configure(config)?;

    println!("main: started");
    let first = create(sleeper, 42)?;
    create(yielder, 0)?;
    create(hog, 0)?;

    println!("\nmain: waiting for thread {} to finish", first.id());
    join(&first)?;
    println!("\nmain: thread {} finished", first.id());

    let abandoned = shutdown()?;
    println!("main: released {} unfinished thread(s)", abandoned);
    Ok(())
}
