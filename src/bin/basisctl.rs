//! basisctl — command-line client for the engine's Unix control socket.
//!
//! One-shot: `basisctl status`, `basisctl budget 0.75`, `basisctl close 0.5`.
//! Without arguments it drops into a small interactive menu.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "basisctl", about = "control client for basisbot")]
struct Cli {
    /// Control socket path.
    #[arg(short, long, default_value = "/tmp/basisbot.sock")]
    socket: PathBuf,

    /// Command to send (status, start, pause, stop, close, budget, spread,
    /// spread_info, pause_close, resume_close, finish_open, finish_close,
    /// transfer). Omit for interactive mode.
    cmd: Option<String>,

    /// Command arguments.
    args: Vec<String>,
}

fn send_cmd(socket: &PathBuf, cmd: &str, args: &[String]) -> Result<Value> {
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("engine not running? cannot connect {}", socket.display()))?;
    let payload = json!({"cmd": cmd, "args": args});
    let mut line = serde_json::to_vec(&payload)?;
    line.push(b'\n');
    stream.write_all(&line)?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;
    if response.trim().is_empty() {
        bail!("no response from engine");
    }
    Ok(serde_json::from_str(response.trim())?)
}

fn fmt_opt_price(v: &Value) -> String {
    v.as_f64().map_or("-".to_string(), |p| format!("{p:.6}"))
}

fn print_response(resp: &Value) {
    if let Some(msg) = resp.get("msg").and_then(Value::as_str) {
        if !msg.is_empty() {
            println!("{msg}");
        }
    }

    // Full status payload.
    if resp.get("paused").is_some() {
        let paused = resp["paused"].as_bool().unwrap_or(false);
        let close = &resp["close_task"];
        let close_running = close["running"].as_bool().unwrap_or(false);

        println!("state: {}", if paused { "paused" } else { "running" });
        println!(
            "direction: {}",
            if close_running { "closing (selling)" } else { "opening (buying)" }
        );
        println!(
            "budget: {:.6} / {:.6} base (remaining {:.6})",
            resp["used"].as_f64().unwrap_or(0.0),
            resp["budget"].as_f64().unwrap_or(0.0),
            resp["remaining"].as_f64().unwrap_or(0.0),
        );

        if close_running {
            println!(
                "close progress: sold {:.6} / {:.6} base, perp bought {:.6}",
                close["spot_sold"].as_f64().unwrap_or(0.0),
                close["target_qty"].as_f64().unwrap_or(0.0),
                close["perp_bought"].as_f64().unwrap_or(0.0),
            );
            let pending = close["pending_hedge"].as_f64().unwrap_or(0.0);
            if pending > 1e-12 {
                println!("pending hedge: {pending:.6}");
            }
            println!("close status: {}", close["msg"].as_str().unwrap_or("-"));
            match close["open_orders"].as_array() {
                Some(orders) if !orders.is_empty() => {
                    println!("live sells ({}):", orders.len());
                    for o in orders {
                        println!(
                            "  price={}, qty={:.6}, filled={:.6}, id={}",
                            o["price"],
                            o["qty"].as_f64().unwrap_or(0.0),
                            o["filled"].as_f64().unwrap_or(0.0),
                            o["id"].as_str().unwrap_or("-"),
                        );
                    }
                }
                _ => println!("live sells: none"),
            }
        } else {
            println!(
                "open progress: bought {:.6} base, perp hedged {:.6}",
                resp["spot_filled_base"].as_f64().unwrap_or(0.0),
                resp["perp_hedged_base"].as_f64().unwrap_or(0.0),
            );
            match resp["active_orders"].as_array() {
                Some(orders) if !orders.is_empty() => {
                    println!("live bids ({}):", orders.len());
                    for o in orders {
                        let level = o["level"].as_u64().unwrap_or(0);
                        let pos = match o["current_level"].as_u64() {
                            Some(cur) => format!("bid{level} (now bid{cur})"),
                            None => format!("bid{level} (below top 5)"),
                        };
                        println!(
                            "  {pos}: price={}, qty={:.6}, hedged={:.6}, id={}",
                            o["price"],
                            o["qty"].as_f64().unwrap_or(0.0),
                            o["hedged"].as_f64().unwrap_or(0.0),
                            o["id"].as_str().unwrap_or("-"),
                        );
                    }
                }
                _ => println!("live bids: none"),
            }
        }

        println!(
            "spread mode: {} (min {:.4} bps, profit floor {:.4} bps)",
            resp["spread_mode"].as_str().unwrap_or("auto"),
            resp["min_spread_bps"].as_f64().unwrap_or(0.0),
            resp["min_profit_bps"].as_f64().unwrap_or(0.0),
        );
        println!("spot avg: {}", fmt_opt_price(&resp["spot_avg_price"]));
        println!("perp avg: {}", fmt_opt_price(&resp["perp_avg_price"]));
        println!(
            "naked exposure: {:.6}",
            resp["naked_exposure"].as_f64().unwrap_or(0.0)
        );
        return;
    }

    // Budget-only payload.
    if resp.get("budget").is_some() {
        println!(
            "budget: {:.6} / {:.6} base (remaining {:.6})",
            resp["used"].as_f64().unwrap_or(0.0),
            resp["budget"].as_f64().unwrap_or(0.0),
            resp["remaining"].as_f64().unwrap_or(0.0),
        );
        return;
    }

    // Spread payload.
    if resp.get("min_spread_bps").is_some() {
        println!(
            "spread mode: {} | min spread {:.4} bps | net cost {:.4} bps | profit floor {:.4} bps",
            resp["spread_mode"].as_str().unwrap_or("auto"),
            resp["min_spread_bps"].as_f64().unwrap_or(0.0),
            resp["net_cost_bps"].as_f64().unwrap_or(0.0),
            resp["min_profit_bps"].as_f64().unwrap_or(0.0),
        );
    }
}

const MENU: &[&str] = &[
    "show status",
    "start quoting",
    "pause quoting",
    "show budget",
    "set budget",
    "close inventory",
    "set min spread",
    "stop engine",
    "quit",
];

fn prompt(text: &str) -> Option<String> {
    print!("{text}");
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    Some(line.trim().to_string())
}

fn interactive(socket: &PathBuf) -> Result<()> {
    println!("basisbot control");
    loop {
        println!();
        for (i, item) in MENU.iter().enumerate() {
            println!("  {}. {}", i + 1, item);
        }
        let Some(choice) = prompt(&format!("choice [1-{}]: ", MENU.len())) else {
            break;
        };
        let Ok(n) = choice.parse::<usize>() else {
            continue;
        };

        let result = match n {
            1 => send_cmd(socket, "status", &[]),
            2 => send_cmd(socket, "start", &[]),
            3 => send_cmd(socket, "pause", &[]),
            4 => send_cmd(socket, "budget", &[]),
            5 => {
                let Some(amount) = prompt("new budget (base): ") else { break };
                if amount.is_empty() {
                    continue;
                }
                send_cmd(socket, "budget", &[amount])
            }
            6 => {
                let Some(qty) = prompt("close quantity (base): ") else { break };
                if qty.is_empty() {
                    continue;
                }
                send_cmd(socket, "close", &[qty])
            }
            7 => {
                let Some(bps) = prompt("min spread bps (or `auto`): ") else { break };
                if bps.is_empty() {
                    continue;
                }
                send_cmd(socket, "spread", &[bps])
            }
            8 => send_cmd(socket, "stop", &[]),
            9 => break,
            _ => continue,
        };

        match result {
            Ok(resp) => print_response(&resp),
            Err(e) => println!("error: {e}"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Some(cmd) => {
            let resp = send_cmd(&cli.socket, &cmd.to_lowercase(), &cli.args)?;
            print_response(&resp);
            Ok(())
        }
        None => interactive(&cli.socket),
    }
}
