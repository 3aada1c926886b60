extern crate corio;
extern crate env_logger;
extern crate serde_json;

use std::sync::mpsc::channel;

use corio as co;
use corio::rpc::{Client, Server, Service};
use serde_json::{json, Value};

struct HelloWorld;

impl Service for HelloWorld {
    fn process(&self, req: &Value, res: &mut Value) {
        res["method"] = req["method"].clone();
        res["err"] = Value::from(200);
        res["data"] = json!({ "hello": "world" });
    }
}

fn main() {
    env_logger::init();

    let server = Server::new(HelloWorld);
    let port = server.start("127.0.0.1", 7788).unwrap();

    let (tx, rx) = channel();
    co::go(move || {
        let mut client = Client::new("127.0.0.1", port);
        for _ in 0..3 {
            let req = json!({ "method": "hello" });
            match client.call(&req) {
                Ok(res) => println!("response: {}", res),
                Err(e) => println!("rpc error: {}", e),
            }
            co::sleep(100);
        }
        tx.send(()).unwrap();
    });

    rx.recv().unwrap();
}
