use std::collections::HashMap;
use std::fs::create_dir_all;
use std::fs::write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use qss::backend::SymbolBackend;
use qss::Error;
use qss::ErrorKind;
use qss::Result;
use qss::SymbolEntry;
use qss::SymbolInfo;


/// Create a file at the logical path `logical` inside `root`.
pub fn put(root: &Path, logical: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(logical.trim_start_matches('/'));
    let () = create_dir_all(path.parent().unwrap()).unwrap();
    let () = write(&path, contents).unwrap();
    path
}


/// A symbol backend answering from a fixed table and counting its
/// invocations.
#[derive(Clone, Debug, Default)]
pub struct FakeBackend {
    /// Known functions, by normalized address.
    functions: HashMap<String, (String, String)>,
    /// Fail every invocation.
    fail: bool,
    calls: Arc<AtomicUsize>,
    targets: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeBackend {
    pub fn new<'a, I>(functions: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    {
        Self {
            functions: functions
                .into_iter()
                .map(|(addr, function, location)| {
                    (addr.to_string(), (function.to_string(), location.to_string()))
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// The number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The files symbolization got requested for.
    pub fn targets(&self) -> Vec<PathBuf> {
        self.targets.lock().unwrap().clone()
    }
}

impl SymbolBackend for FakeBackend {
    fn symbolize(
        &self,
        binary: &Path,
        debug_binary: Option<&Path>,
        addrs: &[String],
        inline: bool,
    ) -> Result<Vec<SymbolInfo>> {
        let _count = self.calls.fetch_add(1, Ordering::SeqCst);
        let () = self
            .targets
            .lock()
            .unwrap()
            .push(debug_binary.unwrap_or(binary).to_path_buf());

        if self.fail {
            return Err(Error::new(ErrorKind::Other, "addr2line crashed"))
        }

        let infos = addrs
            .iter()
            .map(|addr| match self.functions.get(addr) {
                Some((function, location)) => {
                    let mut entries = vec![SymbolEntry::new(function.as_str(), location.as_str())];
                    if inline {
                        let () = entries.push(SymbolEntry::new("caller", "caller.c:99"));
                    }
                    SymbolInfo::new(entries)
                }
                None => SymbolInfo::unknown(),
            })
            .collect();
        Ok(infos)
    }
}
