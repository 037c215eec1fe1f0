/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that hands published [events](crate::events) to their registered handlers.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// How long the event bus waits for an event before checking for a shutdown signal.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct EventHandlers {
    pub(crate) insert_unit_handlers: Vec<HandlerPtr<InsertUnitEvent>>,
    pub(crate) create_unit_handlers: Vec<HandlerPtr<CreateUnitEvent>>,
    pub(crate) receive_preunits_handlers: Vec<HandlerPtr<ReceivePreunitsEvent>>,
    pub(crate) new_epoch_handlers: Vec<HandlerPtr<NewEpochEvent>>,
    pub(crate) finish_epoch_handlers: Vec<HandlerPtr<FinishEpochEvent>>,
    pub(crate) order_round_handlers: Vec<HandlerPtr<OrderRoundEvent>>,
    pub(crate) deliver_preblock_handlers: Vec<HandlerPtr<DeliverPreblockEvent>>,
}

impl EventHandlers {
    /// Collect the user's handlers, preceded by the default loggers if `log_events` is set.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        insert_unit_handler: Option<HandlerPtr<InsertUnitEvent>>,
        create_unit_handler: Option<HandlerPtr<CreateUnitEvent>>,
        receive_preunits_handler: Option<HandlerPtr<ReceivePreunitsEvent>>,
        new_epoch_handler: Option<HandlerPtr<NewEpochEvent>>,
        finish_epoch_handler: Option<HandlerPtr<FinishEpochEvent>>,
        order_round_handler: Option<HandlerPtr<OrderRoundEvent>>,
        deliver_preblock_handler: Option<HandlerPtr<DeliverPreblockEvent>>,
    ) -> EventHandlers {
        fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
            let mut handlers = Vec::new();
            if log_events {
                handlers.push(T::get_logger());
            }
            handlers.extend(user_handler);
            handlers
        }

        EventHandlers {
            insert_unit_handlers: handlers(log_events, insert_unit_handler),
            create_unit_handlers: handlers(log_events, create_unit_handler),
            receive_preunits_handlers: handlers(log_events, receive_preunits_handler),
            new_epoch_handlers: handlers(log_events, new_epoch_handler),
            finish_epoch_handlers: handlers(log_events, finish_epoch_handler),
            order_round_handlers: handlers(log_events, order_round_handler),
            deliver_preblock_handlers: handlers(log_events, deliver_preblock_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.insert_unit_handlers.is_empty()
            && self.create_unit_handlers.is_empty()
            && self.receive_preunits_handlers.is_empty()
            && self.new_epoch_handlers.is_empty()
            && self.finish_epoch_handlers.is_empty()
            && self.order_round_handlers.is_empty()
            && self.deliver_preblock_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::InsertUnit(insert_unit_event) =>
                self.insert_unit_handlers.iter().for_each(|handler| handler(&insert_unit_event)),

            Event::CreateUnit(create_unit_event) =>
                self.create_unit_handlers.iter().for_each(|handler| handler(&create_unit_event)),

            Event::ReceivePreunits(receive_preunits_event) =>
                self.receive_preunits_handlers.iter().for_each(|handler| handler(&receive_preunits_event)),

            Event::NewEpoch(new_epoch_event) =>
                self.new_epoch_handlers.iter().for_each(|handler| handler(&new_epoch_event)),

            Event::FinishEpoch(finish_epoch_event) =>
                self.finish_epoch_handlers.iter().for_each(|handler| handler(&finish_epoch_event)),

            Event::OrderRound(order_round_event) =>
                self.order_round_handlers.iter().for_each(|handler| handler(&order_round_event)),

            Event::DeliverPreblock(deliver_preblock_event) =>
                self.deliver_preblock_handlers.iter().for_each(|handler| handler(&deliver_preblock_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Event bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
