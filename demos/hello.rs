//! Serves a single file `hello.txt` from a directory tree that answers reads from a worker
//! thread, as a tree backed by slow storage would.
//!
//! Usage: `hello <mountpoint> [delay in ms]`

use std::collections::HashMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::thread;
use std::time::Duration;

use evfuse::{Attributes, Completion, Content, DirFiller, DirTree, FileType, Listing, Lookup, SessionBuilder};
use log::info;

const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct HelloTree {
    files: HashMap<OsString, (u64, Vec<u8>)>,
    delay: Duration,
}

impl HelloTree {
    fn new(delay: Duration) -> Self {
        let mut files = HashMap::new();
        files.insert(OsString::from("hello.txt"), (2, b"Hello World!\n".to_vec()));
        Self { files, delay }
    }

    fn attr(&self, ino: u64) -> Option<Attributes> {
        if ino == ROOT_INO {
            return Some(Attributes::new(ROOT_INO, FileType::Directory, 0o755, 0));
        }
        self.files
            .values()
            .find(|(i, _)| *i == ino)
            .map(|(i, data)| Attributes::new(*i, FileType::RegularFile, 0o644, data.len() as u64))
    }
}

impl DirTree for HelloTree {
    fn lookup(&mut self, parent: u64, name: &OsStr, done: Completion<Lookup>) {
        let attr = match self.files.get(name) {
            Some((ino, _)) if parent == ROOT_INO => self.attr(*ino),
            _ => None,
        };
        done.complete(attr.map(Lookup::Found).unwrap_or(Lookup::NotFound));
    }

    fn getattr(&mut self, ino: u64, done: Completion<Lookup>) {
        done.complete(self.attr(ino).map(Lookup::Found).unwrap_or(Lookup::NotFound));
    }

    fn fill_dir(&mut self, ino: u64, _size: u32, _offset: u64, mut filler: DirFiller) {
        if ino != ROOT_INO {
            return filler.done(Listing::NotADirectory);
        }
        filler.add(".", ROOT_INO);
        filler.add("..", ROOT_INO);
        for (name, (ino, _)) in &self.files {
            filler.add(name, *ino);
        }
        filler.done(Listing::Complete);
    }

    fn read(&mut self, ino: u64, _size: u32, _offset: u64, done: Completion<Content>) {
        let data = self.files.values().find(|(i, _)| *i == ino).map(|(_, data)| data.clone());
        let delay = self.delay;
        thread::spawn(move || {
            info!("Fetching inode {} (takes {:?})", ino, delay);
            thread::sleep(delay);
            done.complete(data.map(Content::Data).unwrap_or(Content::Unavailable));
        });
    }
}

fn main() {
    env_logger::init();
    let mut args = env::args_os().skip(1);
    let mountpoint = match args.next() {
        Some(mountpoint) => mountpoint,
        None => {
            eprintln!("Usage: hello <mountpoint> [delay in ms]");
            return;
        }
    };
    let delay = args.next().and_then(|s| s.to_str().and_then(|s| s.parse().ok())).unwrap_or(0);

    let options = [OsStr::new("-o"), OsStr::new("ro,fsname=hello")];
    let result = SessionBuilder::new(HelloTree::new(Duration::from_millis(delay)), &mountpoint)
        .options(&options)
        .foreground(true)
        .run();
    if let Err(err) = result {
        eprintln!("hello: {}", err);
    }
}
