//! Integration tests for the rewriting pipeline.
//!
//! Units are built in memory with the class builder, sent through a pipeline and the
//! rewritten bytes are parsed again and inspected instruction by instruction.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use hotswap::{
    analysis::{repair_method, LenientHierarchy},
    assembly::{decode_all, opcodes::*, Instruction, Operands},
    classfile::{builder::UnitBuilder, MemberAccess},
    prelude::*,
};

/// Host that knows `java/lang/Object` and nothing else and resolves everything.
#[derive(Default)]
struct Host {
    resolved: Mutex<Vec<String>>,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl HostRuntime for Host {
    fn describe_type(&self, _loader: LoaderId, name: &str) -> Option<TypeInfo> {
        (name == "java/lang/Object").then_some(TypeInfo {
            super_name: None,
            is_interface: false,
        })
    }

    fn resolve_types(&self, _loader: LoaderId, types: &[String]) -> Result<()> {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.recv_timeout(Duration::from_secs(10)).ok();
        }
        self.resolved.lock().unwrap().extend(types.iter().cloned());
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Vec<String>>>,
}

impl ChangeListener for Recorder {
    fn after_change(&self, changed: &[ChangedUnit], _added: &[NewUnit]) {
        self.batches
            .lock()
            .unwrap()
            .push(changed.iter().map(|unit| unit.id.name.clone()).collect());
    }
}

struct Counting(AtomicUsize);

impl Rewriter for Counting {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn rewrite(&self, _unit: &mut CompiledUnit, _cx: &mut RewriteContext) -> Result<bool> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

/// Routes the engine's log output to the test harness; `RUST_LOG=hotswap=debug` shows it.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn holder() -> Result<Vec<u8>> {
    counter("t/Holder")
}

/// A unit with an `int count` field, a setter and a getter.
fn counter(name: &str) -> Result<Vec<u8>> {
    let (setter_owner, getter_owner) = (name.to_string(), name.to_string());
    UnitBuilder::new(name)
        .field(MemberAccess::PUBLIC, "count", "I")
        .method(MemberAccess::PUBLIC, "set", "(I)V", move |code| {
            code.op(ALOAD_0)?;
            code.op(ILOAD_1)?;
            code.field(PUTFIELD, &setter_owner, "count", "I")?;
            code.op(RETURN)
        })
        .method(MemberAccess::PUBLIC, "get", "()I", move |code| {
            code.op(ALOAD_0)?;
            code.field(GETFIELD, &getter_owner, "count", "I")?;
            code.op(IRETURN)
        })
        .build()
}

fn plain(name: &str) -> Result<Vec<u8>> {
    UnitBuilder::new(name)
        .method(MemberAccess::STATIC, "answer", "()I", |code| {
            code.push_int(42)?;
            code.op(IRETURN)
        })
        .build()
}

fn instructions(unit: &CompiledUnit, method: usize) -> Result<Vec<Instruction>> {
    decode_all(&unit.methods[method].code().unwrap().code)
}

fn rewritten(outcome: Transformed) -> (Vec<u8>, Vec<usize>) {
    match outcome {
        Transformed::Rewritten {
            bytes,
            modified_methods,
        } => (bytes, modified_methods.into_iter().collect()),
        Transformed::Unchanged => panic!("expected a rewrite"),
    }
}

#[test]
fn no_change_is_cached_for_fixed_units() -> Result<()> {
    let pipeline = PipelineBuilder::new(Arc::new(Host::default())).build()?;
    let counting = Arc::new(Counting(AtomicUsize::new(0)));
    pipeline.add_rewriter(counting.clone());

    let bytes = plain("t/Plain")?;
    for _ in 0..3 {
        let outcome = pipeline.transform(TransformRequest::load("t/Plain", LoaderId(1), bytes.clone()))?;
        assert_eq!(outcome, Transformed::Unchanged);
    }
    // only the first call ran the rewriters
    assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    assert!(pipeline.is_known_unmodified("t/Plain"));
    Ok(())
}

#[test]
fn replaceable_units_are_always_scanned() -> Result<()> {
    let pipeline = PipelineBuilder::new(Arc::new(Host::default()))
        .policy(Arc::new(PrefixPolicy::new(["t."])))
        .build()?;
    let counting = Arc::new(Counting(AtomicUsize::new(0)));
    pipeline.add_rewriter(counting.clone());

    let bytes = plain("t/Plain")?;
    pipeline.transform(TransformRequest::load("t/Plain", LoaderId(1), bytes.clone()))?;
    pipeline.transform(TransformRequest::load("t/Plain", LoaderId(1), bytes))?;
    assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn putfield_keeps_the_original_path() -> Result<()> {
    init_tracing();
    let pipeline = PipelineBuilder::new(Arc::new(Host::default())).build()?;
    let slot = pipeline.add_field("t.Holder", "count", "I", LoaderId(1));
    assert_eq!(slot, 0);

    let original = CompiledUnit::parse(&holder()?)?;
    let original_set = instructions(&original, 0)?;
    let field_index = original_set[2].symbol().unwrap();

    let outcome = pipeline.transform(TransformRequest::load("t/Holder", LoaderId(1), holder()?))?;
    let (bytes, modified) = rewritten(outcome);
    assert_eq!(modified, vec![0, 1]);

    let unit = CompiledUnit::parse(&bytes)?;
    let set = instructions(&unit, 0)?;

    // operands are still pushed exactly as before, the put itself became padding
    assert_eq!(set[0].opcode, ALOAD_0);
    assert_eq!(set[1].opcode, ILOAD_1);
    assert_eq!(
        set[2..5].iter().map(|i| i.opcode).collect::<Vec<_>>(),
        vec![NOP, NOP, NOP]
    );

    // with redirection off the predicate branch lands on the untouched putfield
    let predicate = set.iter().find(|i| i.opcode == IFEQ).unwrap();
    let Operands::Branch(target) = predicate.operands else {
        panic!("ifeq without target");
    };
    let fallback = set.iter().find(|i| i.offset == target).unwrap();
    assert_eq!(fallback.opcode, PUTFIELD);
    assert_eq!(fallback.symbol(), Some(field_index));
    assert_eq!(set.last().unwrap().opcode, RETURN);

    // the join point after the patch carries a frame
    assert!(unit.methods[0].code().unwrap().attribute(&unit.symbols, "StackMapTable").is_some());
    Ok(())
}

#[test]
fn symbol_indices_are_append_only() -> Result<()> {
    let pipeline = PipelineBuilder::new(Arc::new(Host::default())).build()?;
    pipeline.add_field("t/Holder", "count", "I", LoaderId(1));

    let before = CompiledUnit::parse(&holder()?)?;
    let outcome = pipeline.transform(TransformRequest::load("t/Holder", LoaderId(1), holder()?))?;
    let after = CompiledUnit::parse(&rewritten(outcome).0)?;

    assert!(after.symbols.len() > before.symbols.len());
    for (index, symbol) in before.symbols.iter() {
        assert_eq!(after.symbols.get(index), Some(symbol), "symbol {index} moved");
    }
    Ok(())
}

#[test]
fn rewritten_methods_reanalyse_cleanly() -> Result<()> {
    let pipeline = PipelineBuilder::new(Arc::new(Host::default())).build()?;
    pipeline.add_field("t/Holder", "count", "I", LoaderId(1));

    let outcome = pipeline.transform(TransformRequest::load("t/Holder", LoaderId(1), holder()?))?;
    let (bytes, modified) = rewritten(outcome);
    let mut unit = CompiledUnit::parse(&bytes)?;
    for index in modified {
        let max_stack = unit.methods[index].code().unwrap().max_stack;
        // a consistent stack on every path is what lets the frames be rebuilt again
        repair_method(&mut unit, index, &LenientHierarchy)?;
        assert_eq!(unit.methods[index].code().unwrap().max_stack, max_stack);
    }
    Ok(())
}

#[test]
fn other_loaders_are_not_redirected() -> Result<()> {
    let pipeline = PipelineBuilder::new(Arc::new(Host::default())).build()?;
    pipeline.add_field("t/Holder", "count", "I", LoaderId(1));

    let outcome = pipeline.transform(TransformRequest::load("t/Holder", LoaderId(2), holder()?))?;
    assert_eq!(outcome, Transformed::Unchanged);

    pipeline.clear_rewrites("t.Holder", LoaderId(1));
    let outcome = pipeline.transform(TransformRequest::load("t/Holder", LoaderId(1), holder()?))?;
    assert_eq!(outcome, Transformed::Unchanged);
    Ok(())
}

#[test]
fn discarded_loaders_stop_redirecting() -> Result<()> {
    let pipeline = PipelineBuilder::new(Arc::new(Host::default())).build()?;
    pipeline.add_field("t/Gone", "count", "I", LoaderId(1));
    pipeline.add_field("t/Kept", "count", "I", LoaderId(2));

    pipeline.clear_loader(LoaderId(1));

    let outcome = pipeline.transform(TransformRequest::load("t/Kept", LoaderId(2), counter("t/Kept")?))?;
    assert!(outcome.is_rewritten());
    let outcome = pipeline.transform(TransformRequest::load("t/Gone", LoaderId(1), counter("t/Gone")?))?;
    assert_eq!(outcome, Transformed::Unchanged);
    Ok(())
}

#[test]
fn missing_type_becomes_a_throwing_stub() -> Result<()> {
    init_tracing();
    let bytes = UnitBuilder::new("t/Chooser")
        .method(MemberAccess::STATIC, "choose", "(Z)Ljava/lang/Object;", |code| {
            code.field(GETSTATIC, "t/Holder", "count", "I")?;
            code.op(POP)?;
            code.op(ILOAD_0)?;
            code.branch(IFEQ, "other")?;
            code.field(GETSTATIC, "x/Source", "a", "Lx/A;")?;
            code.branch(GOTO, "done")?;
            code.define_label("other")?;
            code.field(GETSTATIC, "x/Source", "b", "Lx/B;")?;
            code.define_label("done")?;
            code.op(ARETURN)
        })
        .method(MemberAccess::STATIC, "answer", "()I", |code| {
            code.push_int(42)?;
            code.op(IRETURN)
        })
        .build()?;
    let original_answer = CompiledUnit::parse(&bytes)?.methods[1].code().unwrap().clone();

    let pipeline = PipelineBuilder::new(Arc::new(Host::default())).build()?;
    pipeline.add_field("t/Holder", "count", "I", LoaderId(1));

    let outcome = pipeline.transform(TransformRequest::load("t/Chooser", LoaderId(1), bytes))?;
    let (bytes, modified) = rewritten(outcome);
    assert_eq!(modified, vec![0]);

    let unit = CompiledUnit::parse(&bytes)?;
    let stub = instructions(&unit, 0)?;
    assert_eq!(
        stub.iter().map(|i| i.opcode).collect::<Vec<_>>(),
        vec![NEW, DUP, LDC, INVOKESPECIAL, ATHROW]
    );
    let stub_code = unit.methods[0].code().unwrap();
    assert!(stub_code.exception_table.is_empty());
    assert_eq!(stub_code.max_locals, 2);

    // the other method is exactly what it was
    assert_eq!(unit.methods[1].code().unwrap(), &original_answer);
    Ok(())
}

#[test]
fn redefinitions_settle_into_one_batch() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let notifier = Arc::new(ChangeNotifier::new());
    notifier.add_listener(recorder.clone());
    let pipeline = PipelineBuilder::new(Arc::new(Host::default()))
        .config(EngineConfig::default().with_debounce_window(Duration::from_millis(100)))
        .notifier(notifier)
        .build()?;
    assert!(!pipeline.retransformation_started());

    for name in ["t/A", "t/B"] {
        pipeline.add_field(name, "count", "I", LoaderId(1));
        let bytes = counter(name)?;
        let outcome =
            pipeline.transform(TransformRequest::redefine(name, LoaderId(1), bytes.clone(), bytes))?;
        assert!(outcome.is_rewritten());
    }
    assert!(pipeline.retransformation_started());
    assert!(pipeline.scheduler().wait_for_settle_timeout(Duration::from_secs(5)));

    let batches = recorder.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], vec!["t/A".to_string(), "t/B".to_string()]);
    Ok(())
}

#[test]
fn unchanged_redefinitions_are_not_reported() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let notifier = Arc::new(ChangeNotifier::new());
    notifier.add_listener(recorder.clone());
    let pipeline = PipelineBuilder::new(Arc::new(Host::default()))
        .config(EngineConfig::default().with_debounce_window(Duration::from_millis(50)))
        .notifier(notifier)
        .build()?;

    let bytes = plain("t/P")?;
    let outcome =
        pipeline.transform(TransformRequest::redefine("t/P", LoaderId(1), bytes.clone(), bytes))?;
    assert_eq!(outcome, Transformed::Unchanged);
    assert!(!pipeline.scheduler().is_waiting());

    std::thread::sleep(Duration::from_millis(200));
    assert!(recorder.batches.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn discovered_fields_hold_the_batch_until_resolved() -> Result<()> {
    struct Lacking;

    impl LoadedTypes for Lacking {
        fn field_exists(&self, _loader: LoaderId, owner: &str, _name: &str) -> Option<bool> {
            (owner == "t/Holder").then_some(false)
        }
    }

    let (release, gate) = mpsc::channel();
    let host = Arc::new(Host {
        gate: Mutex::new(Some(gate)),
        ..Host::default()
    });
    let recorder = Arc::new(Recorder::default());
    let notifier = Arc::new(ChangeNotifier::new());
    notifier.add_listener(recorder.clone());
    let pipeline = PipelineBuilder::new(host.clone())
        .config(EngineConfig::default().with_debounce_window(Duration::from_millis(50)))
        .policy(Arc::new(PrefixPolicy::new(["t/"])))
        .loaded_types(Arc::new(Lacking))
        .notifier(notifier)
        .build()?;

    let bytes = holder()?;
    let outcome = pipeline.transform(TransformRequest::redefine("t/Holder", LoaderId(1), bytes.clone(), bytes))?;
    assert!(outcome.is_rewritten());
    assert_eq!(pipeline.field_storage().rules().len(), 1);

    // well past the window, the batch is still held back by the pending resolution
    std::thread::sleep(Duration::from_millis(300));
    assert!(pipeline.scheduler().is_waiting());
    assert!(recorder.batches.lock().unwrap().is_empty());

    release.send(()).unwrap();
    assert!(pipeline.scheduler().wait_for_settle_timeout(Duration::from_secs(5)));
    assert_eq!(recorder.batches.lock().unwrap().len(), 1);
    assert_eq!(*host.resolved.lock().unwrap(), vec!["t/Holder".to_string()]);
    Ok(())
}

#[test]
fn rewritten_units_are_dumped() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let pipeline = PipelineBuilder::new(Arc::new(Host::default()))
        .config(EngineConfig::default().with_dump_dir(dir.path()))
        .build()?;
    pipeline.add_field("t/Holder", "count", "I", LoaderId(1));

    let outcome = pipeline.transform(TransformRequest::load("t/Holder", LoaderId(1), holder()?))?;
    let (bytes, _) = rewritten(outcome);
    let base = dir.path().join("t");
    assert_eq!(std::fs::read(base.join("Holder.class"))?, bytes);
    assert_eq!(std::fs::read(base.join("Holder$ORIGINAL.class"))?, holder()?);
    Ok(())
}

#[test]
fn tracked_instances_are_reported() -> Result<()> {
    let bytes = UnitBuilder::new("t/Bean")
        .method(MemberAccess::PUBLIC, "<init>", "()V", |code| {
            code.op(ALOAD_0)?;
            code.invoke(INVOKESPECIAL, "java/lang/Object", "<init>", "()V")?;
            code.op(RETURN)
        })
        .build()?;
    let pipeline = PipelineBuilder::new(Arc::new(Host::default()))
        .extension(
            Extension::new("t.BeanHook", |_| {
                Err(Error::Error("not needed here".to_string()))
            })
            .track("t.Bean"),
        )
        .build()?;

    let outcome = pipeline.transform(TransformRequest::load("t/Bean", LoaderId(1), bytes))?;
    let unit = CompiledUnit::parse(&rewritten(outcome).0)?;
    let opcodes: Vec<u8> = instructions(&unit, 0)?.iter().map(|i| i.opcode).collect();
    assert_eq!(opcodes, vec![ALOAD_0, INVOKESPECIAL, LDC, ALOAD_0, INVOKESTATIC, RETURN]);
    Ok(())
}
