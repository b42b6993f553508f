// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, IntCounter, IntGauge, Registry,
};

lazy_static! {
    static ref TASKS_DISPATCHED_TOTAL: IntCounter = register_int_counter!(
        "mbrace_tasks_dispatched_total",
        "Number of tasks posted to workers"
    )
    .unwrap();
    static ref TASKS_RETRIED_TOTAL: IntCounter = register_int_counter!(
        "mbrace_tasks_retried_total",
        "Number of tasks reassigned to a fresh worker"
    )
    .unwrap();
    static ref TASKS_RECOVERED_TOTAL: IntCounter = register_int_counter!(
        "mbrace_tasks_recovered_total",
        "Number of tasks reissued after a worker failure"
    )
    .unwrap();
    static ref DUPLICATE_TASK_RESULTS_TOTAL: IntCounter = register_int_counter!(
        "mbrace_duplicate_task_results_total",
        "Number of dropped results for tasks not in the log"
    )
    .unwrap();
    static ref TASK_LOG_SIZE: IntGauge = register_int_gauge!(
        "mbrace_task_log_size",
        "Number of outstanding logged tasks"
    )
    .unwrap();
    static ref PROCESSES_CREATED_TOTAL: IntCounter = register_int_counter!(
        "mbrace_processes_created_total",
        "Number of admitted processes"
    )
    .unwrap();
    static ref PROCESSES_KILLED_TOTAL: IntCounter = register_int_counter!(
        "mbrace_processes_killed_total",
        "Number of killed processes"
    )
    .unwrap();
    static ref WORKER_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "mbrace_worker_failures_total",
        "Number of workers removed from the pool after failure"
    )
    .unwrap();
    static ref SYSTEM_FAULTS_TOTAL: IntCounter = register_int_counter!(
        "mbrace_system_faults_total",
        "Number of process manager system faults"
    )
    .unwrap();
}

/// Forces registration of all metrics and returns the registry backing them.
pub fn register_all() -> Registry {
    TASKS_DISPATCHED_TOTAL.reset();
    TASKS_RETRIED_TOTAL.reset();
    TASKS_RECOVERED_TOTAL.reset();
    DUPLICATE_TASK_RESULTS_TOTAL.reset();
    TASK_LOG_SIZE.set(0);
    PROCESSES_CREATED_TOTAL.reset();
    PROCESSES_KILLED_TOTAL.reset();
    WORKER_FAILURES_TOTAL.reset();
    SYSTEM_FAULTS_TOTAL.reset();
    prometheus::default_registry().clone()
}

pub fn record_task_dispatched() {
    TASKS_DISPATCHED_TOTAL.inc();
}

pub fn record_task_retried() {
    TASKS_RETRIED_TOTAL.inc();
}

pub fn record_tasks_recovered(count: u64) {
    TASKS_RECOVERED_TOTAL.inc_by(count);
}

pub fn record_duplicate_task_result() {
    DUPLICATE_TASK_RESULTS_TOTAL.inc();
}

pub fn record_task_log_size(size: usize) {
    TASK_LOG_SIZE.set(size as i64);
}

pub fn record_process_created() {
    PROCESSES_CREATED_TOTAL.inc();
}

pub fn record_process_killed() {
    PROCESSES_KILLED_TOTAL.inc();
}

pub fn record_worker_failure() {
    WORKER_FAILURES_TOTAL.inc();
}

pub fn record_system_fault() {
    SYSTEM_FAULTS_TOTAL.inc();
}
