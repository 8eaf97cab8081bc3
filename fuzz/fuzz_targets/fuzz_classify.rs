#![no_main]

use libfuzzer_sys::fuzz_target;
use packfs::{PathClass, PathClassifier, RouterConfig};

fuzz_target!(|data: &[u8]| {
    let Ok(path) = std::str::from_utf8(data) else {
        return;
    };
    let classifier = PathClassifier::new(&RouterConfig::default());

    let class = classifier.classify(path);
    if class == PathClass::Virtual {
        assert!(classifier.strip_scope(path).is_some());
    }

    let wide: Vec<u16> = path.encode_utf16().collect();
    assert_eq!(classifier.classify_wide(&wide), class);

    if classifier.is_relative(path) {
        let _ = classifier.expand("/__packfs__/a", path);
    }
});
