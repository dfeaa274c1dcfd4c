use crate::{
    clock::ClockClass,
    error::Error,
    event::{Event, EventClass},
    schema::{
        resolve::{self, ResolveOptions},
        ArrayType, FieldPath, FieldType, IntegerType, NativeByteOrder, StructType,
    },
    stream::{Stream, StreamClass},
    value::Environment,
};
use fxhash::FxHashMap;
use std::{path::Path, sync::Arc};
use tracing::debug;
use uuid::Uuid;

/// The default packet header: magic number, trace UUID, stream class
/// id.
fn default_packet_header_type() -> FieldType {
    let mut st = StructType::new();
    st.add_field("magic", IntegerType::new(32).expect("valid size").into())
        .expect("fresh structure");
    st.add_field(
        "uuid",
        ArrayType::new(IntegerType::new(8).expect("valid size").into(), 16).into(),
    )
    .expect("fresh structure");
    st.add_field("stream_id", IntegerType::new(32).expect("valid size").into())
        .expect("fresh structure");
    st.into()
}

fn freeze_arc(ty: &mut Arc<FieldType>) {
    if !ty.is_frozen() {
        Arc::make_mut(ty).freeze();
    }
}

/// The top-level IR container: environment, UUID, native byte order,
/// packet header type, clock classes, and stream classes.
///
/// Adding a stream class (or later, an event class) runs the
/// validation pass: the concerned field types are cloned, resolved,
/// auto-mapped to clocks, and frozen; on failure the trace is left
/// untouched.
#[derive(Clone, Debug)]
pub struct Trace {
    frozen: bool,
    environment: Environment,
    uuid: Uuid,
    native_byte_order: Option<NativeByteOrder>,
    packet_header_type: Option<Arc<FieldType>>,
    clock_classes: Vec<Arc<ClockClass>>,
    stream_classes: Vec<StreamClass>,
    next_stream_ids: FxHashMap<u64, u64>,
    resolve_options: ResolveOptions,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            frozen: false,
            environment: Environment::new(),
            uuid: Uuid::new_v4(),
            native_byte_order: None,
            packet_header_type: Some(Arc::new(default_packet_header_type())),
            clock_classes: Vec::new(),
            stream_classes: Vec::new(),
            next_stream_ids: FxHashMap::default(),
            resolve_options: ResolveOptions::default(),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.environment
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn native_byte_order(&self) -> Option<NativeByteOrder> {
        self.native_byte_order
    }

    pub fn packet_header_type(&self) -> Option<&Arc<FieldType>> {
        self.packet_header_type.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("trace"))
        } else {
            Ok(())
        }
    }

    pub fn set_uuid(&mut self, uuid: Uuid) -> Result<(), Error> {
        self.check_frozen()?;
        self.uuid = uuid;
        Ok(())
    }

    pub fn set_native_byte_order(&mut self, byte_order: NativeByteOrder) -> Result<(), Error> {
        self.check_frozen()?;
        self.native_byte_order = Some(byte_order);
        Ok(())
    }

    pub fn set_packet_header_type(&mut self, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        self.packet_header_type = Some(Arc::new(ty));
        Ok(())
    }

    /// Resolver configuration used by subsequent validation passes.
    pub fn set_resolve_options(&mut self, options: ResolveOptions) {
        self.resolve_options = options;
    }

    /// Registers a clock class, freezing it. Clock names are unique
    /// within a trace.
    pub fn add_clock_class(&mut self, mut clock: ClockClass) -> Result<Arc<ClockClass>, Error> {
        if self
            .clock_classes
            .iter()
            .any(|c| c.name() == clock.name())
        {
            return Err(Error::invalid(format!(
                "trace already has a clock class named '{}'",
                clock.name()
            )));
        }
        clock.freeze();
        let clock = Arc::new(clock);
        self.clock_classes.push(clock.clone());
        Ok(clock)
    }

    pub fn clock_classes(&self) -> &[Arc<ClockClass>] {
        &self.clock_classes
    }

    pub fn clock_class_by_name(&self, name: &str) -> Option<&Arc<ClockClass>> {
        self.clock_classes
            .iter()
            .find(|c| c.name().as_str() == name)
    }

    pub fn stream_classes(&self) -> &[StreamClass] {
        &self.stream_classes
    }

    pub fn stream_class(&self, id: u64) -> Option<&StreamClass> {
        self.stream_classes.iter().find(|sc| sc.id() == Some(id))
    }

    /// Attaches a stream class: resolves and freezes the packet header
    /// and all of the class's scope types, then installs the validated
    /// clones. On error the trace is unchanged.
    pub fn add_stream_class(&mut self, mut stream_class: StreamClass) -> Result<u64, Error> {
        let id = match stream_class.id {
            Some(id) => {
                if self.stream_class(id).is_some() {
                    return Err(Error::invalid(format!(
                        "trace already has a stream class with id {id}"
                    )));
                }
                id
            }
            None => {
                let mut id = self.stream_classes.len() as u64;
                while self.stream_class(id).is_some() {
                    id += 1;
                }
                id
            }
        };

        // Work on clones so a failed validation leaves every original
        // untouched and freezing never leaks through shared ancestors.
        let mut scopes: [Option<Arc<FieldType>>; 6] = [
            self.packet_header_type.clone(),
            stream_class.packet_context_type.clone(),
            stream_class.event_header_type.clone(),
            stream_class.event_context_type.clone(),
            None,
            None,
        ];

        if let Some(clock) = self.auto_map_clock(&stream_class) {
            if let Some(header) = scopes[2].as_mut() {
                auto_map_timestamp(header, &clock)?;
            }
        }

        let mut validated_event_classes = Vec::with_capacity(stream_class.event_classes.len());
        if stream_class.event_classes.is_empty() {
            resolve::resolve_types(&mut scopes, self.resolve_options)?;
        }
        for event_class in stream_class.event_classes.iter() {
            let mut event_class = event_class.as_ref().clone();
            scopes[4] = event_class.context_type.clone();
            scopes[5] = event_class.payload_type.clone();
            resolve::resolve_types(&mut scopes, self.resolve_options)?;
            event_class.context_type = scopes[4].take();
            event_class.payload_type = scopes[5].take();
            validated_event_classes.push(event_class);
        }

        // Validation succeeded: install the clones and freeze.
        for scope in scopes[..4].iter_mut().flatten() {
            freeze_arc(scope);
        }
        stream_class.event_classes = validated_event_classes
            .into_iter()
            .map(|mut ec| {
                if let Some(ty) = ec.context_type.as_mut() {
                    freeze_arc(ty);
                }
                if let Some(ty) = ec.payload_type.as_mut() {
                    freeze_arc(ty);
                }
                ec.frozen = true;
                Arc::new(ec)
            })
            .collect();

        let [header, packet_context, event_header, event_context, _, _] = scopes;
        self.packet_header_type = header;
        stream_class.packet_context_type = packet_context;
        stream_class.event_header_type = event_header;
        stream_class.event_context_type = event_context;
        stream_class.id = Some(id);
        stream_class.frozen = true;

        debug!(
            id,
            name = %stream_class.name(),
            event_classes = stream_class.event_classes.len(),
            "Attached stream class"
        );
        self.stream_classes.push(stream_class);
        self.environment.freeze();
        self.frozen = true;
        Ok(id)
    }

    /// Attaches an event class to an already attached stream class,
    /// validating only the newly added subtree.
    pub fn add_event_class(
        &mut self,
        stream_class_id: u64,
        mut event_class: EventClass,
    ) -> Result<u64, Error> {
        let index = self
            .stream_classes
            .iter()
            .position(|sc| sc.id() == Some(stream_class_id))
            .ok_or(Error::UndefinedStreamId(stream_class_id))?;

        let mut scopes: [Option<Arc<FieldType>>; 6] = {
            let sc = &self.stream_classes[index];
            [
                self.packet_header_type.clone(),
                sc.packet_context_type.clone(),
                sc.event_header_type.clone(),
                sc.event_context_type.clone(),
                event_class.context_type.clone(),
                event_class.payload_type.clone(),
            ]
        };
        resolve::resolve_types(&mut scopes, self.resolve_options)?;

        event_class.context_type = scopes[4].take();
        event_class.payload_type = scopes[5].take();
        if let Some(ty) = event_class.context_type.as_mut() {
            freeze_arc(ty);
        }
        if let Some(ty) = event_class.payload_type.as_mut() {
            freeze_arc(ty);
        }
        event_class.frozen = true;

        let sc = &mut self.stream_classes[index];
        let id = sc.next_event_class_id;
        event_class.id = Some(id);
        sc.next_event_class_id += 1;
        sc.event_classes.push(Arc::new(event_class));
        Ok(id)
    }

    fn auto_map_clock(&self, stream_class: &StreamClass) -> Option<Arc<ClockClass>> {
        stream_class.clock.clone().or_else(|| {
            // Unambiguous only when the trace has a single clock.
            if self.clock_classes.len() == 1 {
                Some(self.clock_classes[0].clone())
            } else {
                None
            }
        })
    }

    /// Creates a writable stream of the given class, backed by a file
    /// named `<class-name>_<stream-id>` in `directory`.
    pub fn create_stream(
        &mut self,
        stream_class_id: u64,
        directory: &Path,
    ) -> Result<Stream, Error> {
        let byte_order = self
            .native_byte_order
            .ok_or_else(|| Error::validation("trace native byte order is unspecified"))?;
        if self.stream_class(stream_class_id).is_none() {
            return Err(Error::UndefinedStreamId(stream_class_id));
        }
        let header_type = self
            .packet_header_type
            .clone()
            .ok_or_else(|| Error::invalid("trace has no packet header type"))?;

        let next = self.next_stream_ids.entry(stream_class_id).or_insert(0);
        let stream_id = *next;
        *next += 1;

        let stream_class = self
            .stream_class(stream_class_id)
            .expect("checked above");
        Stream::create(
            directory,
            stream_id,
            stream_class,
            byte_order,
            header_type,
            self.uuid,
        )
    }

    /// Instantiates an event of the named class. The stream class must
    /// already be attached (its types resolved and frozen).
    pub fn create_event(
        &self,
        stream_class_id: u64,
        event_class_name: &str,
    ) -> Result<Event, Error> {
        let sc = self
            .stream_class(stream_class_id)
            .ok_or(Error::UndefinedStreamId(stream_class_id))?;
        let ec = sc
            .event_class_by_name(event_class_name)
            .ok_or_else(|| Error::not_found(event_class_name))?;
        Ok(Event::new(
            ec.clone(),
            sc.event_header_type.clone(),
            sc.event_context_type.clone(),
        ))
    }

    /// Follows a field path through the attached scope types. Event
    /// scopes require the owning event class id.
    pub fn field_type_at(
        &self,
        stream_class_id: u64,
        event_class_id: Option<u64>,
        path: &FieldPath,
    ) -> Option<Arc<FieldType>> {
        let sc = self.stream_class(stream_class_id)?;
        let (event_context, event_payload) = match event_class_id {
            Some(id) => {
                let ec = sc.event_class_by_id(id)?;
                (ec.context_type().cloned(), ec.payload_type().cloned())
            }
            None => (None, None),
        };
        let scopes = [
            self.packet_header_type.clone(),
            sc.packet_context_type().cloned(),
            sc.event_header_type().cloned(),
            sc.event_context_type().cloned(),
            event_context,
            event_payload,
        ];
        let view: resolve::ScopeView<'_> = std::array::from_fn(|i| scopes[i].as_ref());
        resolve::field_type_at_path(&view, path).cloned()
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps the event header's `timestamp` integer to the stream's clock
/// when the field exists and has no mapping yet.
fn auto_map_timestamp(header: &mut Arc<FieldType>, clock: &Arc<ClockClass>) -> Result<(), Error> {
    if header.is_frozen() {
        return Ok(());
    }
    let Some(index) = header.field_index("timestamp") else {
        return Ok(());
    };
    {
        let member = header
            .child_at(index as i32)
            .expect("index from the type");
        let Some(int) = member.as_integer() else {
            return Ok(());
        };
        if int.mapped_clock().is_some() {
            return Ok(());
        }
    }
    let node = Arc::make_mut(header);
    let child = node.child_at_mut(index as i32).expect("checked above");
    match Arc::make_mut(child) {
        FieldType::Integer(t) => t.map_clock(clock.clone()),
        _ => unreachable!("checked to be an integer above"),
    }
}
