mod consumers;
mod end_to_end;
mod helpers;
mod pools;
mod publishers;
mod rabbitmq;
mod topology;
